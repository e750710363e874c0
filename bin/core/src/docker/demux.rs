/// Demultiplexed daemon output.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DemuxedOutput {
  pub stdout: String,
  pub stderr: String,
}

impl DemuxedOutput {
  pub fn combined(&self) -> String {
    match (self.stdout.is_empty(), self.stderr.is_empty()) {
      (false, true) => self.stdout.clone(),
      (true, false) => self.stderr.clone(),
      _ => format!("{}{}", self.stdout, self.stderr),
    }
  }
}

/// Splits the daemon's multiplexed log / attach stream into stdout
/// and stderr.
///
/// Frames are `[type(1), pad(3), size_be(4), payload(size)]`, type 1
/// stdout / 2 stderr. Tty containers don't frame their output, so on
/// the first invalid header the remainder is treated as raw text.
pub fn demux_output(bytes: &[u8]) -> DemuxedOutput {
  let mut out = DemuxedOutput::default();
  let mut rest = bytes;
  while rest.len() >= 8 {
    let stream_type = rest[0];
    let valid_header = matches!(stream_type, 0 | 1 | 2)
      && rest[1] == 0
      && rest[2] == 0
      && rest[3] == 0;
    if !valid_header {
      break;
    }
    let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]])
      as usize;
    if rest.len() < 8 + size {
      break;
    }
    let payload = String::from_utf8_lossy(&rest[8..8 + size]);
    match stream_type {
      2 => out.stderr.push_str(&payload),
      _ => out.stdout.push_str(&payload),
    }
    rest = &rest[8 + size..];
  }
  if !rest.is_empty() {
    out.stdout.push_str(&String::from_utf8_lossy(rest));
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream_type, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
  }

  #[test]
  fn splits_stdout_and_stderr_frames() {
    let mut bytes = frame(1, b"hello ");
    bytes.extend(frame(2, b"oops\n"));
    bytes.extend(frame(1, b"world\n"));
    let out = demux_output(&bytes);
    assert_eq!(out.stdout, "hello world\n");
    assert_eq!(out.stderr, "oops\n");
  }

  #[test]
  fn tty_output_passes_through_as_raw_text() {
    let bytes = b"plain tty output, no framing";
    let out = demux_output(bytes);
    assert_eq!(out.stdout, "plain tty output, no framing");
    assert!(out.stderr.is_empty());
  }

  #[test]
  fn invalid_header_falls_back_to_raw_for_the_remainder() {
    let mut bytes = frame(1, b"framed");
    bytes.extend_from_slice(b"\xff garbage tail");
    let out = demux_output(&bytes);
    assert!(out.stdout.starts_with("framed"));
    assert!(out.stdout.contains("garbage tail"));
  }

  #[test]
  fn truncated_frame_is_kept_as_raw_text() {
    let mut bytes = vec![1, 0, 0, 0];
    bytes.extend_from_slice(&100u32.to_be_bytes());
    bytes.extend_from_slice(b"short");
    let out = demux_output(&bytes);
    assert!(out.stdout.contains("short"));
  }

  #[test]
  fn empty_input_is_empty_output() {
    assert_eq!(demux_output(&[]), DemuxedOutput::default());
  }
}

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

const READ_CHUNK: usize = 8 * 1024;

/// Bytes read from one output stream of a sandboxed process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    /// More than `cap` bytes were produced, `bytes` holds only the first `cap`.
    pub truncated: bool,
}

/// Capture shared between a reader thread and the monitor, so whatever was
/// read survives a stream that never reaches EOF.
#[derive(Debug, Default, Clone)]
pub struct SharedCapture(Arc<Mutex<CapturedStream>>);

impl SharedCapture {
    fn lock(&self) -> MutexGuard<'_, CapturedStream> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> CapturedStream {
        self.lock().clone()
    }
}

/// Read `reader` until EOF into `capture`, keeping at most `cap` bytes.
///
/// Reading stops as soon as the cap is crossed and `overflow` is raised, so the
/// monitor can kill the writer instead of letting it spin on a full pipe.
pub fn read_bounded(
    mut reader: impl Read,
    cap: usize,
    overflow: &AtomicBool,
    capture: &SharedCapture,
) {
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(nread) => {
                let mut captured = capture.lock();
                let room = cap.saturating_sub(captured.bytes.len());
                if nread > room {
                    captured.bytes.extend_from_slice(&buffer[..room]);
                    captured.truncated = true;
                    overflow.store(true, Ordering::SeqCst);
                    debug!("output cap of {} bytes reached", cap);
                    break;
                }
                captured.bytes.extend_from_slice(&buffer[..nread]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("read error: {:?}", e);
                break;
            }
        }
    }
}

/// Feed `input` to the child and close the stream. A child that exits without
/// consuming its input is not an error.
pub fn write_all_and_close(mut writer: impl Write, input: &[u8]) {
    if let Err(e) = writer.write_all(input) {
        if e.kind() != ErrorKind::BrokenPipe {
            debug!("write error: {:?}", e);
        }
    }
}

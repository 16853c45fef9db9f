/// Streaming output collection for the supervised child
///
/// The child's stdout and stderr share one pipe. A reader thread forwards raw
/// chunks over a channel as they arrive so the supervisor can multiplex
/// output with cancellation and its deadline.
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const READ_CHUNK_SIZE: usize = 8192;

/// Upper bound on how long the reader takes to notice a stop request
const STOP_POLL_MS: u16 = 50;

#[derive(Debug)]
pub enum OutputChunk {
    Data(Vec<u8>),
    /// Stream closed; no further chunks follow
    Eof,
    /// Read failed; treated as end of stream
    Error(std::io::Error),
}

/// Handle on the reader thread.
///
/// A descendant that left the child's process group can keep the write end
/// open forever, so the thread never blocks in `read` without first seeing
/// the pipe readable, and checks for a stop request in between.
pub struct OutputReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl OutputReader {
    /// Wait for a reader that already reported end of stream.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Output reader panicked");
            }
        }
    }

    /// Stop reading, even if the pipe is still open, and wait for the thread.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                debug!("Output pipe still open; stopping the reader");
            }
            if handle.join().is_err() {
                warn!("Output reader panicked");
            }
        }
    }
}

impl Drop for OutputReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Spawn a thread reading `source` until end of stream or [`OutputReader::stop`].
pub fn spawn_reader(mut source: File) -> std::io::Result<(Receiver<OutputChunk>, OutputReader)> {
    let (tx, rx) = unbounded();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let handle = thread::Builder::new()
        .name("fuzzbox-output".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            while !stop_flag.load(Ordering::SeqCst) {
                let ready = {
                    let mut fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
                    poll(&mut fds, PollTimeout::from(STOP_POLL_MS))
                };
                match ready {
                    Ok(0) | Err(Errno::EINTR) => continue,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(OutputChunk::Error(std::io::Error::from(e)));
                        break;
                    }
                }

                match source.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(OutputChunk::Eof);
                        break;
                    }
                    Ok(n) => {
                        if tx.send(OutputChunk::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(OutputChunk::Error(e));
                        break;
                    }
                }
            }
        })?;

    Ok((
        rx,
        OutputReader {
            stop,
            handle: Some(handle),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use std::io::Write;
    use std::time::{Duration, Instant};

    fn pipe() -> (File, File) {
        let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        (File::from(read_end), File::from(write_end))
    }

    #[test]
    fn reader_forwards_data_then_eof() {
        let (read_end, mut write_end) = pipe();
        let (rx, reader) = spawn_reader(read_end).unwrap();
        write_end.write_all(b"hello\nworld\n").unwrap();
        drop(write_end);

        let mut collected = Vec::new();
        loop {
            match rx.recv().unwrap() {
                OutputChunk::Data(bytes) => collected.extend(bytes),
                OutputChunk::Eof => break,
                OutputChunk::Error(e) => panic!("unexpected read error: {e}"),
            }
        }
        reader.join();
        assert_eq!(collected, b"hello\nworld\n");
    }

    #[test]
    fn stop_releases_reader_on_open_pipe() {
        let (read_end, mut write_end) = pipe();
        let (rx, reader) = spawn_reader(read_end).unwrap();
        write_end.write_all(b"partial").unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            OutputChunk::Data(_)
        ));

        // the write end stays open, as with an escaped grandchild
        let started = Instant::now();
        reader.stop();
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        drop(write_end);
    }
}

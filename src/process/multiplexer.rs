//! Non-blocking draining of a child's stdout and stderr.
//!
//! Each tick waits (bounded) until at least one stream is readable, then does
//! exactly one read(2) on each ready stream. A read on a ready pipe returns
//! whatever is buffered without blocking, so a slow or idle stream can never
//! hold up the other one.
//!
//! The informational stream is drained either line by line (build output) or
//! in small chunks after a short settle delay (serial console, where a prompt
//! has no trailing newline). The diagnostic stream is always line-buffered.

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::process::ExitStatus;
use std::time::Duration;

use super::{Deadline, PollWait, ReadinessWait, Supervised};
use crate::error::{CiError, IoContext, Result};

const LINE_READ_SIZE: usize = 4096;
/// Upper bound for a single readiness wait inside `drain_until`.
const POLL_BUDGET: Duration = Duration::from_secs(1);

/// Anything the multiplexer can poll and read.
pub trait Source: Read + AsFd {}

impl<T: Read + AsFd> Source for T {}

/// How the informational stream is cut into deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// One delivery per line, newline stripped.
    Lines,
    /// One delivery per read of at most `size` bytes, after sleeping `settle`.
    Chunks { size: usize, settle: Duration },
}

/// Receives output as it is drained.
pub trait OutputSink {
    /// Output from the informational stream.
    fn info(&mut self, data: &[u8]) -> Result<()>;

    /// Output from the diagnostic stream.
    fn error(&mut self, data: &[u8]) -> Result<()>;

    /// True once the consumer has what it was waiting for.
    fn satisfied(&self) -> bool {
        false
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing became readable within the budget.
    Idle,
    /// At least one stream was read.
    Drained,
    /// Both streams reached EOF.
    Closed,
}

/// Why `drain_until` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainEnd {
    /// The sink reported it was satisfied.
    Satisfied,
    /// The child exited; its buffered output has been drained.
    ChildExited(ExitStatus),
    /// The deadline passed with the child still running.
    Expired,
}

struct Channel {
    reader: Box<dyn Source>,
    mode: Granularity,
    pending: Vec<u8>,
    open: bool,
}

impl Channel {
    fn new(reader: Box<dyn Source>, mode: Granularity) -> Self {
        Self {
            reader,
            mode,
            pending: Vec::new(),
            open: true,
        }
    }

    /// One read on a stream that poll reported ready. Returns deliveries.
    fn read_ready(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let size = match self.mode {
            Granularity::Lines => LINE_READ_SIZE,
            Granularity::Chunks { size, settle } => {
                // Lets a prompt written in pieces arrive as one chunk, most of the time.
                if !settle.is_zero() {
                    std::thread::sleep(settle);
                }
                size
            }
        };

        let mut buf = vec![0u8; size];
        let n = match self.reader.read(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        if n == 0 {
            self.open = false;
            return Ok(self.flush());
        }
        buf.truncate(n);

        match self.mode {
            Granularity::Chunks { .. } => Ok(vec![buf]),
            Granularity::Lines => {
                self.pending.extend_from_slice(&buf);
                Ok(self.complete_lines())
            }
        }
    }

    fn complete_lines(&mut self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Whatever is left of an unterminated last line.
    fn flush(&mut self) -> Vec<Vec<u8>> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        vec![std::mem::take(&mut self.pending)]
    }
}

/// Drains two streams without letting either one block the other.
pub struct StreamMultiplexer<W: ReadinessWait = PollWait> {
    info: Channel,
    diag: Channel,
    waiter: W,
}

impl StreamMultiplexer<PollWait> {
    pub fn new(
        info: impl Source + 'static,
        diag: impl Source + 'static,
        mode: Granularity,
    ) -> Self {
        Self::with_waiter(info, diag, mode, PollWait)
    }

    /// Take over a supervised child's stdout (info) and stderr (diagnostic).
    pub fn for_child(child: &mut Supervised, mode: Granularity) -> Result<Self> {
        let (stdout, stderr) = child.take_output().ok_or_else(|| {
            CiError::io(
                format!("attaching to `{}`", child.program()),
                io::Error::new(io::ErrorKind::NotConnected, "output pipes already taken"),
            )
        })?;
        Ok(Self::new(stdout, stderr, mode))
    }
}

impl<W: ReadinessWait> StreamMultiplexer<W> {
    pub fn with_waiter(
        info: impl Source + 'static,
        diag: impl Source + 'static,
        mode: Granularity,
        waiter: W,
    ) -> Self {
        Self {
            info: Channel::new(Box::new(info), mode),
            diag: Channel::new(Box::new(diag), Granularity::Lines),
            waiter,
        }
    }

    pub fn is_closed(&self) -> bool {
        !self.info.open && !self.diag.open
    }

    /// Wait up to `budget` for output, then drain the ready stream(s) once.
    pub fn tick(&mut self, budget: Duration, sink: &mut dyn OutputSink) -> Result<Tick> {
        let mut fds = Vec::with_capacity(2);
        if self.info.open {
            fds.push(self.info.reader.as_fd());
        }
        if self.diag.open {
            fds.push(self.diag.reader.as_fd());
        }
        if fds.is_empty() {
            // Both pipes are gone; just let the budget pass.
            std::thread::sleep(budget);
            return Ok(Tick::Closed);
        }

        let ready = self
            .waiter
            .wait(&fds, budget)
            .io_context(|| "waiting for child output")?;
        let mut flags = ready.into_iter();
        let info_ready = self.info.open && flags.next().unwrap_or(false);
        let diag_ready = self.diag.open && flags.next().unwrap_or(false);

        if !info_ready && !diag_ready {
            return Ok(Tick::Idle);
        }
        if info_ready {
            for data in self.info.read_ready().io_context(|| "reading child stdout")? {
                sink.info(&data)?;
            }
        }
        if diag_ready {
            for data in self.diag.read_ready().io_context(|| "reading child stderr")? {
                sink.error(&data)?;
            }
        }

        if self.is_closed() {
            Ok(Tick::Closed)
        } else {
            Ok(Tick::Drained)
        }
    }

    /// Drain until the sink is satisfied, the child exits, or `deadline` passes.
    pub fn drain_until(
        &mut self,
        child: &mut Supervised,
        deadline: Deadline,
        sink: &mut dyn OutputSink,
    ) -> Result<DrainEnd> {
        loop {
            if sink.satisfied() {
                return Ok(DrainEnd::Satisfied);
            }
            if let Some(status) = child.try_exit()? {
                self.drain_remaining(deadline, sink)?;
                if sink.satisfied() {
                    return Ok(DrainEnd::Satisfied);
                }
                return Ok(DrainEnd::ChildExited(status));
            }
            if deadline.expired() {
                return Ok(DrainEnd::Expired);
            }
            self.tick(deadline.cap(POLL_BUDGET), sink)?;
        }
    }

    /// Pick up output the child wrote before exiting, without waiting for more.
    pub fn drain_remaining(&mut self, deadline: Deadline, sink: &mut dyn OutputSink) -> Result<()> {
        while !deadline.expired() && !sink.satisfied() {
            match self.tick(Duration::ZERO, sink)? {
                Tick::Drained => continue,
                Tick::Idle | Tick::Closed => break,
            }
        }
        for data in self.info.flush() {
            sink.info(&data)?;
        }
        for data in self.diag.flush() {
            sink.error(&data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::BorrowedFd;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Collect {
        info: Vec<Vec<u8>>,
        error: Vec<Vec<u8>>,
    }

    impl OutputSink for Collect {
        fn info(&mut self, data: &[u8]) -> Result<()> {
            self.info.push(data.to_vec());
            Ok(())
        }
        fn error(&mut self, data: &[u8]) -> Result<()> {
            self.error.push(data.to_vec());
            Ok(())
        }
    }

    fn lines(v: &[Vec<u8>]) -> Vec<String> {
        v.iter().map(|l| String::from_utf8_lossy(l).into_owned()).collect()
    }

    #[test]
    fn partial_line_is_held_until_newline() {
        let (mut out_tx, out_rx) = UnixStream::pair().unwrap();
        let (_err_tx, err_rx) = UnixStream::pair().unwrap();
        let mut mux = StreamMultiplexer::new(out_rx, err_rx, Granularity::Lines);
        let mut sink = Collect::default();

        out_tx.write_all(b"hel").unwrap();
        assert_eq!(mux.tick(Duration::from_secs(1), &mut sink).unwrap(), Tick::Drained);
        assert!(sink.info.is_empty());

        out_tx.write_all(b"lo\r\nworld\n").unwrap();
        mux.tick(Duration::from_secs(1), &mut sink).unwrap();
        assert_eq!(lines(&sink.info), vec!["hello", "world"]);
    }

    #[test]
    fn idle_stream_does_not_block_the_busy_one() {
        let (mut out_tx, out_rx) = UnixStream::pair().unwrap();
        // stderr stays open and silent for the whole test
        let (_err_tx, err_rx) = UnixStream::pair().unwrap();
        let mut mux = StreamMultiplexer::new(out_rx, err_rx, Granularity::Lines);
        let mut sink = Collect::default();

        for i in 0..3 {
            writeln!(out_tx, "line {i}").unwrap();
            mux.tick(Duration::from_secs(1), &mut sink).unwrap();
        }
        assert_eq!(lines(&sink.info), vec!["line 0", "line 1", "line 2"]);
        assert!(sink.error.is_empty());
    }

    #[test]
    fn routes_streams_to_their_own_sink() {
        let (mut out_tx, out_rx) = UnixStream::pair().unwrap();
        let (mut err_tx, err_rx) = UnixStream::pair().unwrap();
        let mut mux = StreamMultiplexer::new(out_rx, err_rx, Granularity::Lines);
        let mut sink = Collect::default();

        out_tx.write_all(b"a\nb\n").unwrap();
        err_tx.write_all(b"E1\n").unwrap();
        drop(out_tx);
        drop(err_tx);

        while mux.tick(Duration::from_millis(200), &mut sink).unwrap() != Tick::Closed {}
        assert_eq!(lines(&sink.info), vec!["a", "b"]);
        assert_eq!(lines(&sink.error), vec!["E1"]);
        assert!(mux.is_closed());
    }

    #[test]
    fn chunks_are_delivered_raw() {
        let (mut out_tx, out_rx) = UnixStream::pair().unwrap();
        let (_err_tx, err_rx) = UnixStream::pair().unwrap();
        let mode = Granularity::Chunks {
            size: 4,
            settle: Duration::ZERO,
        };
        let mut mux = StreamMultiplexer::new(out_rx, err_rx, mode);
        let mut sink = Collect::default();

        out_tx.write_all(b"isar login:").unwrap();
        mux.tick(Duration::from_secs(1), &mut sink).unwrap();
        assert_eq!(sink.info, vec![b"isar".to_vec()]);
    }

    #[test]
    fn unterminated_last_line_is_flushed_on_eof() {
        let (mut out_tx, out_rx) = UnixStream::pair().unwrap();
        let (err_tx, err_rx) = UnixStream::pair().unwrap();
        drop(err_tx);
        let mut mux = StreamMultiplexer::new(out_rx, err_rx, Granularity::Lines);
        let mut sink = Collect::default();

        out_tx.write_all(b"no newline").unwrap();
        drop(out_tx);
        while mux.tick(Duration::from_millis(200), &mut sink).unwrap() != Tick::Closed {}
        assert_eq!(lines(&sink.info), vec!["no newline"]);
    }

    #[test]
    fn idle_tick_when_nothing_arrives() {
        let (_out_tx, out_rx) = UnixStream::pair().unwrap();
        let (_err_tx, err_rx) = UnixStream::pair().unwrap();
        let mut mux = StreamMultiplexer::new(out_rx, err_rx, Granularity::Lines);
        let mut sink = Collect::default();
        assert_eq!(mux.tick(Duration::from_millis(20), &mut sink).unwrap(), Tick::Idle);
    }

    struct ScriptedWait(Vec<Vec<bool>>);

    impl ReadinessWait for ScriptedWait {
        fn wait(&mut self, fds: &[BorrowedFd<'_>], _budget: Duration) -> io::Result<Vec<bool>> {
            let next = if self.0.is_empty() {
                vec![false; fds.len()]
            } else {
                self.0.remove(0)
            };
            Ok(next)
        }
    }

    #[test]
    fn only_ready_streams_are_read() {
        let (mut out_tx, out_rx) = UnixStream::pair().unwrap();
        let (mut err_tx, err_rx) = UnixStream::pair().unwrap();
        out_tx.write_all(b"out\n").unwrap();
        err_tx.write_all(b"err\n").unwrap();

        // Readiness layer claims only stderr is ready on the first tick.
        let waiter = ScriptedWait(vec![vec![false, true], vec![true, false]]);
        let mut mux = StreamMultiplexer::with_waiter(out_rx, err_rx, Granularity::Lines, waiter);
        let mut sink = Collect::default();

        mux.tick(Duration::ZERO, &mut sink).unwrap();
        assert!(sink.info.is_empty());
        assert_eq!(lines(&sink.error), vec!["err"]);

        mux.tick(Duration::ZERO, &mut sink).unwrap();
        assert_eq!(lines(&sink.info), vec!["out"]);
    }
}

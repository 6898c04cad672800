use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Destination for frames released in sequence order by the reorder buffer.
pub trait FrameSink: Send {
    fn write_frame(&mut self, seq: u32, payload: &[u8]) -> io::Result<()>;

    /// Called once after the final flush. `total_len` is the stream length
    /// announced by the sources, used to cut the padding of the last frame.
    fn finish(&mut self, _total_len: Option<u64>) -> io::Result<()> {
        Ok(())
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn write_frame(&mut self, seq: u32, payload: &[u8]) -> io::Result<()> {
        (**self).write_frame(seq, payload)
    }

    fn finish(&mut self, total_len: Option<u64>) -> io::Result<()> {
        (**self).finish(total_len)
    }
}

/// In-memory sink, mostly for tests.
impl FrameSink for Vec<u8> {
    fn write_frame(&mut self, _seq: u32, payload: &[u8]) -> io::Result<()> {
        self.extend_from_slice(payload);
        Ok(())
    }

    fn finish(&mut self, total_len: Option<u64>) -> io::Result<()> {
        if let Some(len) = total_len {
            if (self.len() as u64) > len {
                self.truncate(len as usize);
            }
        }
        Ok(())
    }
}

/// Discards output.
#[derive(Debug, Default)]
pub struct NullSink {
    frames: u64,
}

impl NullSink {
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameSink for NullSink {
    fn write_frame(&mut self, _seq: u32, _payload: &[u8]) -> io::Result<()> {
        self.frames += 1;
        Ok(())
    }
}

/// Writes the reassembled stream to a local file.
pub struct FileSink {
    writer: BufWriter<File>,
    written: u64,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "output: writing stream to file");
        Ok(Self {
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for FileSink {
    fn write_frame(&mut self, _seq: u32, payload: &[u8]) -> io::Result<()> {
        self.writer.write_all(payload)?;
        self.written += payload.len() as u64;
        Ok(())
    }

    fn finish(&mut self, total_len: Option<u64>) -> io::Result<()> {
        self.writer.flush()?;
        if let Some(len) = total_len {
            if self.written > len {
                self.writer.get_ref().set_len(len)?;
                self.written = len;
            }
        }
        Ok(())
    }
}

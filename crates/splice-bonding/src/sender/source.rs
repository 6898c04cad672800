use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use splice_transport::wire::{StreamInfo, DATA_LEN, TEST_FILENAME};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Seed shared by every server so a synthetic sequence is byte-identical no
/// matter which source sends or resends it.
pub const SYNTHETIC_SEED: u64 = 0x5E11_CE00_D47A;

/// Produces the payload of each data sequence (1-based).
pub trait PayloadSource: Send {
    fn stream_info(&self) -> StreamInfo;

    /// Exactly [`DATA_LEN`] bytes for `seq`, or `None` past the end.
    fn payload(&mut self, seq: u32) -> io::Result<Option<Bytes>>;
}

/// Streams a local file in `DATA_LEN` chunks; the last chunk is zero padded.
pub struct FileSource {
    file: File,
    info: StreamInfo,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let info = StreamInfo::for_len(file.metadata()?.len());
        Ok(Self { file, info })
    }
}

impl PayloadSource for FileSource {
    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn payload(&mut self, seq: u32) -> io::Result<Option<Bytes>> {
        if seq == 0 || seq > self.info.total_packets {
            return Ok(None);
        }
        let offset = u64::from(seq - 1) * DATA_LEN as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut chunk = BytesMut::zeroed(DATA_LEN);
        let mut filled = 0;
        while filled < DATA_LEN {
            let n = self.file.read(&mut chunk[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Some(chunk.freeze()))
    }
}

/// Test stream of `packets` pseudo-random chunks. Each chunk depends only on
/// its sequence number.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    packets: u32,
    seed: u64,
}

impl SyntheticSource {
    pub fn new(packets: u32) -> Self {
        Self::with_seed(packets, SYNTHETIC_SEED)
    }

    pub fn with_seed(packets: u32, seed: u64) -> Self {
        Self { packets, seed }
    }

    /// Payload of `seq` without range checks.
    pub fn chunk(&self, seq: u32) -> Bytes {
        let mut rng = StdRng::seed_from_u64(self.seed ^ u64::from(seq));
        let mut chunk = BytesMut::zeroed(DATA_LEN);
        for b in chunk.iter_mut() {
            *b = rng.random();
        }
        chunk.freeze()
    }
}

impl PayloadSource for SyntheticSource {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo::for_len(u64::from(self.packets) * DATA_LEN as u64)
    }

    fn payload(&mut self, seq: u32) -> io::Result<Option<Bytes>> {
        if seq == 0 || seq > self.packets {
            return Ok(None);
        }
        Ok(Some(self.chunk(seq)))
    }
}

/// Files a server is willing to stream.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    files: Vec<String>,
    synthetic_packets: u32,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>, files: Vec<String>, synthetic_packets: u32) -> Self {
        Self {
            root: root.into(),
            files,
            synthetic_packets,
        }
    }

    /// Open the source for `filename`. `Ok(None)` means the request must be
    /// refused.
    pub fn open(&self, filename: &str) -> io::Result<Option<Box<dyn PayloadSource>>> {
        if filename == TEST_FILENAME {
            debug!(packets = self.synthetic_packets, "serving synthetic stream");
            return Ok(Some(Box::new(SyntheticSource::new(self.synthetic_packets))));
        }
        if !self.files.iter().any(|f| f == filename) {
            info!(filename, "requested file is not in the catalog");
            return Ok(None);
        }
        let path = self.root.join(filename);
        match FileSource::open(&path) {
            Ok(src) => Ok(Some(Box::new(src))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "catalog file is missing on disk");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

//! On-disk framing shared by the journal, the WAL file and snapshots.
//!
//! Append-only logs are sequences of `[u32 length BE][u32 CRC32 BE][bincode payload]`
//! frames. Appends go through a [`LogWriter`], which group-commits them on a
//! dedicated thread. Snapshots are `[bincode payload][magic][u32 CRC32 BE]`
//! and are replaced atomically via temp-file + rename.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

/// Most queued appends written ahead of one fsync.
pub const GROUP_COMMIT_MAX_BATCH: usize = 256;

/// Diagnostic statistics from reading a framed log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameReadStats {
    /// Number of records successfully decoded.
    pub records: usize,
    /// Number of records skipped due to decode errors (CRC was valid).
    pub skipped: usize,
    /// Number of CRC mismatches encountered (reading stopped).
    pub crc_errors: usize,
    /// Whether reading was terminated by a torn final frame or a length
    /// header pointing past the end of the file.
    pub truncated: bool,
}

impl FrameReadStats {
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.crc_errors == 0 && !self.truncated
    }
}

/// Serialize a record into its frame: `[u32 len BE][u32 crc32 BE][bincode payload]`.
pub fn encode_frame<T: Serialize>(record: &T) -> io::Result<Vec<u8>> {
    let bytes = bincode::serialize(record).map_err(|e| io::Error::other(e.to_string()))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds 4 GiB"))?;
    let crc = crc32fast::hash(&bytes);

    let mut framed = Vec::with_capacity(8 + bytes.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&crc.to_be_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}

/// Encode every record as consecutive frames.
pub fn encode_frames<T: Serialize>(records: &[T]) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    for record in records {
        output.extend_from_slice(&encode_frame(record)?);
    }
    Ok(output)
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

type Ack = oneshot::Sender<io::Result<()>>;

enum WriteRequest {
    Append { framed: Vec<u8>, done: Ack },
    Replace { bytes: Vec<u8>, done: Ack },
}

/// Group-commit writer for one append-only log.
///
/// A dedicated thread owns the file. Appends that queue up while it is busy
/// are written together and made durable with a single fsync; each caller
/// is answered once its frame is on disk. [`LogWriter::replace`] travels
/// through the same queue, so it is ordered with respect to appends.
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    requests: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
}

impl LogWriter {
    /// Open (creating if needed) `path` and start its writer thread.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let thread_path = path.to_path_buf();
        std::thread::Builder::new()
            .name("vecstore-log-writer".into())
            .spawn(move || writer_loop(thread_path, file, rx))?;
        Ok(Self {
            path: path.to_path_buf(),
            requests: Mutex::new(Some(tx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one encoded frame. Returns once it is durable.
    pub async fn append(&self, framed: Vec<u8>) -> io::Result<()> {
        self.submit(|done| WriteRequest::Append { framed, done })
            .await
    }

    /// Atomically replace the whole log with `bytes`.
    pub async fn replace(&self, bytes: Vec<u8>) -> io::Result<()> {
        self.submit(|done| WriteRequest::Replace { bytes, done })
            .await
    }

    async fn submit(&self, request: impl FnOnce(Ack) -> WriteRequest) -> io::Result<()> {
        let (done, result) = oneshot::channel();
        {
            let requests = self.requests.lock();
            let sent = requests
                .as_ref()
                .map(|tx| tx.send(request(done)).is_ok())
                .unwrap_or(false);
            if !sent {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "log writer stopped"));
            }
        }
        result
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log write result lost"))?
    }

    /// Stop accepting writes. The writer thread exits once its queue is drained.
    pub fn shutdown(&self) {
        self.requests.lock().take();
    }
}

fn writer_loop(path: PathBuf, mut file: File, mut requests: mpsc::UnboundedReceiver<WriteRequest>) {
    let mut appends: Vec<(Vec<u8>, Ack)> = Vec::with_capacity(GROUP_COMMIT_MAX_BATCH);
    while let Some(first) = requests.blocking_recv() {
        let mut next = Some(first);
        while let Some(request) = next.take() {
            match request {
                WriteRequest::Append { framed, done } => appends.push((framed, done)),
                WriteRequest::Replace { bytes, done } => {
                    flush_appends(&path, &mut file, &mut appends);
                    let result = write_atomic(&path, &bytes).and_then(|()| {
                        file = open_append(&path)?;
                        Ok(())
                    });
                    let _ = done.send(result);
                }
            }
            if appends.len() < GROUP_COMMIT_MAX_BATCH {
                next = requests.try_recv().ok();
            }
        }
        flush_appends(&path, &mut file, &mut appends);
    }
    tracing::debug!(path = %path.display(), "log writer stopped");
}

/// Write every queued frame, fsync once, and answer each caller. A failed
/// batch is cut back off the file so later appends do not follow a torn frame.
fn flush_appends(path: &Path, file: &mut File, appends: &mut Vec<(Vec<u8>, Ack)>) {
    if appends.is_empty() {
        return;
    }
    let start = file.metadata().map(|m| m.len());
    let mut buffer = Vec::with_capacity(appends.iter().map(|(f, _)| f.len()).sum());
    for (framed, _) in appends.iter() {
        buffer.extend_from_slice(framed);
    }
    let result = file.write_all(&buffer).and_then(|()| file.sync_all());
    if let Err(e) = &result {
        tracing::warn!(path = %path.display(), error = %e, frames = appends.len(), "log append failed");
        if let Ok(len) = start {
            if let Err(e) = file.set_len(len) {
                tracing::warn!(path = %path.display(), error = %e, "failed to cut back torn append");
            }
        }
    } else {
        tracing::trace!(path = %path.display(), frames = appends.len(), bytes = buffer.len(), "log batch committed");
    }
    for (_, done) in appends.drain(..) {
        let _ = done.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

/// Read every frame of a log, verifying CRC32 checksums.
///
/// A missing file reads as empty. Reading stops at the first torn frame,
/// length header running past the end of the file, or checksum mismatch;
/// frames that pass the checksum but fail to decode are skipped.
pub fn read_frames<T: DeserializeOwned>(path: &Path) -> io::Result<(Vec<T>, FrameReadStats)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok((Vec::new(), FrameReadStats::default()))
        }
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut stats = FrameReadStats::default();
    let mut header_buf = [0u8; 8];
    let mut offset: u64 = 0;

    loop {
        match read_full(&mut reader, &mut header_buf)? {
            0 => break,
            n if n < header_buf.len() => {
                tracing::warn!(path = %path.display(), "log truncated inside frame header");
                stats.truncated = true;
                break;
            }
            _ => {}
        }
        offset += header_buf.len() as u64;
        let len = u32::from_be_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]])
            as usize;
        let stored_crc =
            u32::from_be_bytes([header_buf[4], header_buf[5], header_buf[6], header_buf[7]]);
        if len as u64 > file_len.saturating_sub(offset) {
            tracing::warn!(path = %path.display(), len, offset, "frame length runs past end of log, stopping");
            stats.truncated = true;
            break;
        }
        let mut data = vec![0u8; len];
        match reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!(path = %path.display(), "log truncated mid-frame, stopping");
                stats.truncated = true;
                break;
            }
            Err(e) => return Err(e),
        }
        offset += len as u64;
        if crc32fast::hash(&data) != stored_crc {
            tracing::warn!(path = %path.display(), "frame CRC mismatch, stopping");
            stats.crc_errors += 1;
            break;
        }
        match bincode::deserialize::<T>(&data) {
            Ok(record) => {
                records.push(record);
                stats.records += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "frame decode failed, skipping");
                stats.skipped += 1;
            }
        }
    }

    Ok((records, stats))
}

/// Like `read_exact` but reports how many bytes were read before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Append `[magic][u32 CRC32 BE]` to a payload.
pub fn seal(payload: &[u8], magic: &[u8; 4]) -> Vec<u8> {
    let crc = crc32fast::hash(payload);
    let mut output = Vec::with_capacity(payload.len() + 8);
    output.extend_from_slice(payload);
    output.extend_from_slice(magic);
    output.extend_from_slice(&crc.to_be_bytes());
    output
}

/// Verify and strip a `[magic][u32 CRC32 BE]` footer.
pub fn unseal<'a>(raw: &'a [u8], magic: &[u8; 4]) -> Result<&'a [u8], String> {
    if raw.len() < 8 || &raw[raw.len() - 8..raw.len() - 4] != magic {
        return Err("missing checksum footer".to_string());
    }
    let payload = &raw[..raw.len() - 8];
    let tail = &raw[raw.len() - 4..];
    let stored_crc = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return Err(format!(
            "CRC32 mismatch: expected {stored_crc:#010x}, got {computed_crc:#010x}"
        ));
    }
    Ok(payload)
}

/// Atomic write: write to a sibling temp file, fsync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        // Persist the rename itself; not all platforms allow opening directories.
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Rec {
        A(u32),
        B { name: String },
    }

    #[test]
    fn test_frame_format() {
        let framed = encode_frame(&Rec::A(7)).unwrap();
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        let stored_crc = u32::from_be_bytes([framed[4], framed[5], framed[6], framed[7]]);
        let payload = &framed[8..];
        assert_eq!(payload.len(), len);
        assert_eq!(crc32fast::hash(payload), stored_crc);
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let writer = LogWriter::open(&path).unwrap();
        writer.append(encode_frame(&Rec::A(1)).unwrap()).await.unwrap();
        writer
            .append(encode_frame(&Rec::B { name: "x".into() }).unwrap())
            .await
            .unwrap();
        writer.shutdown();

        let (records, stats) = read_frames::<Rec>(&path).unwrap();
        assert_eq!(records, vec![Rec::A(1), Rec::B { name: "x".into() }]);
        assert!(stats.is_clean());
        assert_eq!(stats.records, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_all_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let writer = std::sync::Arc::new(LogWriter::open(&path).unwrap());

        let mut handles = Vec::new();
        for i in 0..64u32 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                writer.append(encode_frame(&Rec::A(i)).unwrap()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let (mut records, stats) = read_frames::<Rec>(&path).unwrap();
        assert!(stats.is_clean());
        records.sort_by_key(|r| match r {
            Rec::A(n) => *n,
            Rec::B { .. } => u32::MAX,
        });
        assert_eq!(records, (0..64).map(Rec::A).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_replace_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let writer = LogWriter::open(&path).unwrap();
        writer.append(encode_frame(&Rec::A(1)).unwrap()).await.unwrap();
        writer
            .replace(encode_frames(&[Rec::A(10), Rec::A(11)]).unwrap())
            .await
            .unwrap();
        writer.append(encode_frame(&Rec::A(12)).unwrap()).await.unwrap();

        let (records, _) = read_frames::<Rec>(&path).unwrap();
        assert_eq!(records, vec![Rec::A(10), Rec::A(11), Rec::A(12)]);
    }

    #[tokio::test]
    async fn test_append_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LogWriter::open(&dir.path().join("log.bin")).unwrap();
        writer.shutdown();
        let err = writer.append(encode_frame(&Rec::A(1)).unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (records, stats) = read_frames::<Rec>(&dir.path().join("absent")).unwrap();
        assert!(records.is_empty());
        assert!(stats.is_clean());
    }

    #[test]
    fn test_torn_tail_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut bytes = encode_frame(&Rec::A(1)).unwrap();
        let second = encode_frame(&Rec::A(2)).unwrap();
        bytes.extend_from_slice(&second[..second.len() - 2]);
        fs::write(&path, &bytes).unwrap();

        let (records, stats) = read_frames::<Rec>(&path).unwrap();
        assert_eq!(records, vec![Rec::A(1)]);
        assert!(stats.truncated);
    }

    #[test]
    fn test_torn_header_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut bytes = encode_frame(&Rec::A(1)).unwrap();
        bytes.extend_from_slice(&[0, 0, 0]);
        fs::write(&path, &bytes).unwrap();
        let (records, stats) = read_frames::<Rec>(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert!(stats.truncated);
    }

    #[test]
    fn test_crc_corruption_stops_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut bytes = encode_frame(&Rec::B { name: "hello".into() }).unwrap();
        bytes.extend_from_slice(&encode_frame(&Rec::A(9)).unwrap());
        bytes[10] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        let (records, stats) = read_frames::<Rec>(&path).unwrap();
        assert!(records.is_empty());
        assert_eq!(stats.crc_errors, 1);
    }

    #[test]
    fn test_oversized_length_header_stops_without_allocating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut bytes = encode_frame(&Rec::A(1)).unwrap();
        let mut second = encode_frame(&Rec::B { name: "intact".into() }).unwrap();
        // Length claims ~4 GiB while the CRC and payload bytes are untouched.
        second[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&second);
        fs::write(&path, &bytes).unwrap();

        let (records, stats) = read_frames::<Rec>(&path).unwrap();
        assert_eq!(records, vec![Rec::A(1)]);
        assert!(stats.truncated);
        assert_eq!(stats.crc_errors, 0);
    }

    #[test]
    fn test_shrunken_length_header_fails_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut bytes = encode_frame(&Rec::A(1)).unwrap();
        let mut second = encode_frame(&Rec::B { name: "intact".into() }).unwrap();
        let len = u32::from_be_bytes([second[0], second[1], second[2], second[3]]);
        second[..4].copy_from_slice(&(len - 2).to_be_bytes());
        bytes.extend_from_slice(&second);
        bytes.extend_from_slice(&encode_frame(&Rec::A(3)).unwrap());
        fs::write(&path, &bytes).unwrap();

        let (records, stats) = read_frames::<Rec>(&path).unwrap();
        assert_eq!(records, vec![Rec::A(1)]);
        assert_eq!(stats.crc_errors, 1);
    }

    #[test]
    fn test_seal_unseal() {
        let sealed = seal(b"payload", b"TEST");
        assert_eq!(unseal(&sealed, b"TEST").unwrap(), b"payload");
        assert!(unseal(&sealed, b"NOPE").is_err());
        let mut bad = sealed.clone();
        bad[0] ^= 1;
        assert!(unseal(&bad, b"TEST").unwrap_err().contains("CRC32"));
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!path.with_extension("tmp").exists());
    }
}

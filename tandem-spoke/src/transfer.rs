//! Session upload.
//!
//! Sends one recorded session directory to the hub's transfer receiver as a
//! single connection: a JSON header line, then a ZIP archive streamed
//! straight onto the socket. The archive is never staged on disk.
//!
//! ```text
//! {"session_id":"...","filename":"<session>_<device>.zip","device_id":"..."}\n
//! PK\x03\x04 ... (zip bytes until close)
//! ```

use std::fs::{self, File};
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_types::TransferHeader;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::SendError;

/// Archive name for a session upload.
pub fn archive_name(session_id: &str, device_id: &str) -> String {
    format!("{session_id}_{device_id}.zip")
}

/// Where and how to send a session.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Local session directory.
    pub dir: PathBuf,
    /// Hub host.
    pub host: String,
    /// Hub transfer port.
    pub port: u16,
    /// Session id announced in the header.
    pub session_id: String,
    /// Device id announced in the header.
    pub device_id: String,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Per-write timeout.
    pub write_timeout: Duration,
}

/// Stream `request.dir` to the hub. Returns the archive size in bytes.
pub async fn send_session(request: SendRequest) -> Result<u64, SendError> {
    tokio::task::spawn_blocking(move || send_blocking(&request))
        .await
        .map_err(|e| SendError::Join(e.to_string()))?
}

fn send_blocking(request: &SendRequest) -> Result<u64, SendError> {
    if !request.dir.is_dir() {
        return Err(SendError::MissingSession {
            path: request.dir.clone(),
        });
    }

    let stream = connect(&request.host, request.port, request.connect_timeout)?;
    stream.set_write_timeout(Some(request.write_timeout))?;
    stream.set_nodelay(true)?;

    let header = TransferHeader {
        session_id: request.session_id.clone(),
        filename: archive_name(&request.session_id, &request.device_id),
        device_id: request.device_id.clone(),
        size: None,
    };
    let mut stream = io::BufWriter::new(stream);
    stream.write_all(&header.to_line()?)?;

    let counted = Arc::new(AtomicU64::new(0));
    let mut zip = ZipWriter::new_stream(CountingWriter {
        inner: stream,
        count: counted.clone(),
    });
    write_tree(&mut zip, &request.dir)?;
    let mut stream = zip.finish()?;
    stream.flush()?;

    let bytes = counted.load(Ordering::Relaxed);
    tracing::info!(
        "Sent {} ({} bytes) to {}:{}",
        header.filename,
        bytes,
        request.host,
        request.port
    );
    Ok(bytes)
}

fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, SendError> {
    let addr_text = format!("{host}:{port}");
    let connect_err = |source| SendError::Connect {
        addr: addr_text.clone(),
        source,
    };
    let addrs = (host, port).to_socket_addrs().map_err(connect_err)?;

    let mut last = io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = e,
        }
    }
    Err(connect_err(last))
}

/// Add every file under `root` to the archive, keyed by its relative path.
fn write_tree<W: Write + io::Seek>(zip: &mut ZipWriter<W>, root: &Path) -> Result<(), SendError> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut stack = vec![PathBuf::new()];

    while let Some(rel) = stack.pop() {
        let mut entries = fs::read_dir(root.join(&rel))?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let rel_path = rel.join(entry.file_name());
            let name = entry_name(&rel_path);
            if entry.file_type()?.is_dir() {
                zip.add_directory(name, options)?;
                stack.push(rel_path);
            } else {
                zip.start_file(name, options)?;
                let mut file = File::open(entry.path())?;
                io::copy(&mut file, zip)?;
            }
        }
    }
    Ok(())
}

fn entry_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Cursor, Read};
    use std::net::TcpListener;

    fn session_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.txt"), "y").unwrap();
        dir
    }

    fn request(dir: &Path, port: u16) -> SendRequest {
        SendRequest {
            dir: dir.to_path_buf(),
            host: "127.0.0.1".into(),
            port,
            session_id: "s1".into(),
            device_id: "dev-1".into(),
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn streams_header_and_archive() {
        let dir = session_fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let receiver = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            reader.read_until(b'\n', &mut line).unwrap();
            let mut body = Vec::new();
            reader.read_to_end(&mut body).unwrap();
            (line, body)
        });

        let sent = send_session(request(dir.path(), port)).await.unwrap();
        let (line, body) = receiver.join().unwrap();

        let header = TransferHeader::from_line(&line).unwrap();
        assert_eq!(header.session_id, "s1");
        assert_eq!(header.filename, "s1_dev-1.zip");
        assert_eq!(header.device_id, "dev-1");
        assert_eq!(sent, body.len() as u64);

        let mut archive = zip::ZipArchive::new(Cursor::new(body)).unwrap();
        let mut a = String::new();
        archive.by_name("a.txt").unwrap().read_to_string(&mut a).unwrap();
        assert_eq!(a, "x");
        let mut b = String::new();
        archive
            .by_name("sub/b.txt")
            .unwrap()
            .read_to_string(&mut b)
            .unwrap();
        assert_eq!(b, "y");
    }

    #[tokio::test]
    async fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = send_session(request(&dir.path().join("nope"), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::MissingSession { .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let dir = session_fixture();
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = send_session(request(dir.path(), port)).await.unwrap_err();
        assert!(matches!(err, SendError::Connect { .. }));
    }

    #[test]
    fn entry_names_use_forward_slashes() {
        let rel = Path::new("sub").join("deeper").join("f.csv");
        assert_eq!(entry_name(&rel), "sub/deeper/f.csv");
    }
}

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl MockResponse {
    pub fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self::new(
            status,
            vec![("Content-Type", "application/x-amz-json-1.1")],
            body.as_bytes().to_vec(),
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Serves scripted responses in order. Connections are kept alive, so a
/// client may send several requests over one accepted socket.
pub struct MockServer {
    pub base_url: String,
    served: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    pub fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("mock server address");
        listener.set_nonblocking(true).expect("nonblocking listener");

        let served = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let state = (
            Arc::clone(&served),
            Arc::clone(&connections),
            Arc::clone(&captured),
        );

        let join = thread::spawn(move || {
            let (served, connections, captured) = state;
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut script = responses.into_iter().peekable();

            while script.peek().is_some() && Instant::now() < deadline {
                let stream = match listener.accept() {
                    Ok((stream, _)) => stream,
                    Err(error) if error.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(_) => return,
                };
                connections.fetch_add(1, Ordering::SeqCst);
                let Ok(mut connection) = Connection::open(stream) else {
                    continue;
                };
                while script.peek().is_some() {
                    let Ok(request) = connection.read_request() else {
                        break;
                    };
                    captured.lock().expect("captured requests").push(request);
                    served.fetch_add(1, Ordering::SeqCst);
                    let Some(response) = script.next() else {
                        break;
                    };
                    thread::sleep(response.delay);
                    if connection.write_response(&response).is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            connections,
            captured,
            join: Some(join),
        }
    }

    pub fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().expect("captured requests").clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// An address nothing listens on.
pub fn closed_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind throwaway listener");
    let address = listener.local_addr().expect("throwaway address");
    drop(listener);
    format!("http://{address}")
}

/// One accepted socket. The reader keeps its buffer between requests so
/// pipelined bytes are never lost.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        // An idle keep-alive socket gives up so the next connection is accepted.
        stream.set_read_timeout(Some(Duration::from_secs(1)))?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        })
    }

    fn line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::from(ErrorKind::UnexpectedEof));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_owned())
    }

    fn read_request(&mut self) -> io::Result<CapturedRequest> {
        let request_line = self.line()?;
        let mut parts = request_line.split(' ');
        let method = parts.next().unwrap_or_default().to_owned();
        let path = parts.next().unwrap_or_default().to_owned();

        let mut headers = BTreeMap::new();
        loop {
            let line = self.line()?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }

        let chunked = headers
            .get("transfer-encoding")
            .is_some_and(|value| value.eq_ignore_ascii_case("chunked"));
        let body = if chunked {
            self.chunked_body()?
        } else {
            let length = headers
                .get("content-length")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0_usize);
            let mut body = vec![0_u8; length];
            self.reader.read_exact(&mut body)?;
            body
        };

        Ok(CapturedRequest {
            method,
            path,
            headers,
            body,
        })
    }

    fn chunked_body(&mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let size_line = self.line()?;
            let size_text = size_line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|error| io::Error::new(ErrorKind::InvalidData, error))?;
            if size == 0 {
                // Trailer section ends with an empty line.
                while !self.line()?.is_empty() {}
                return Ok(body);
            }
            let start = body.len();
            body.resize(start + size, 0);
            self.reader.read_exact(&mut body[start..])?;
            self.line()?;
        }
    }

    fn write_response(&mut self, response: &MockResponse) -> io::Result<()> {
        let mut head = Vec::new();
        write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            response.status,
            reason_phrase(response.status)
        )?;
        write!(head, "Content-Length: {}\r\n", response.body.len())?;
        for (name, value) in &response.headers {
            write!(head, "{name}: {value}\r\n")?;
        }
        head.extend_from_slice(b"\r\n");
        head.extend_from_slice(&response.body);
        self.writer.write_all(&head)?;
        self.writer.flush()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        307 => "Temporary Redirect",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

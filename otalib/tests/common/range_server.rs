//! Minimal HTTP/1.1 server serving a single body with Range GET support.
//!
//! Every request's `Range` header is recorded so that tests can check where a
//! transfer resumed from.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

#[derive(Clone, Copy, Debug)]
pub struct RangeServerOptions {
    /// If set, every GET is answered with this status and an error body.
    pub status: Option<u16>,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Delay after each 8 KiB chunk of the body.
    pub chunk_delay: Option<Duration>,
    /// Close the connection after sending this many body bytes (first request
    /// only).
    pub truncate_first_at: Option<usize>,
    /// Close the connection after sending this many body bytes, on every
    /// request.
    pub truncate_each_at: Option<usize>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            status: None,
            support_ranges: true,
            chunk_delay: None,
            truncate_first_at: None,
            truncate_each_at: None,
        }
    }
}

pub struct RangeServer {
    /// Full URL of the served file.
    pub url: String,
    requests: Arc<Mutex<Vec<Option<String>>>>,
}

impl RangeServer {
    /// `Range` header of every GET received so far, in order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let requests = Arc::new(Mutex::new(vec![]));

    thread::spawn({
        let requests = requests.clone();
        move || {
            for stream in listener.incoming().flatten() {
                let body = body.clone();
                let requests = requests.clone();
                thread::spawn(move || handle(stream, &body, opts, &requests));
            }
        }
    });

    RangeServer {
        url: format!("http://127.0.0.1:{port}/ota.zip"),
        requests,
    }
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    opts: RangeServerOptions,
    requests: &Mutex<Vec<Option<String>>>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };

    let (method, range_header) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    let request_index = {
        let mut requests = requests.lock().unwrap();
        requests.push(range_header.map(str::to_owned));
        requests.len() - 1
    };

    if let Some(status) = opts.status {
        let message = b"not found";
        let response = format!(
            "HTTP/1.1 {status} Error\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            message.len(),
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.write_all(message);
        return;
    }

    let total = body.len();
    let start = range_header
        .filter(|_| opts.support_ranges)
        .and_then(parse_range_start);

    let (status, extra, slice) = match start {
        Some(s) if s >= total => (
            "416 Range Not Satisfiable",
            format!("Content-Range: bytes */{total}\r\n"),
            &body[0..0],
        ),
        Some(s) => (
            "206 Partial Content",
            format!("Content-Range: bytes {s}-{}/{total}\r\n", total - 1),
            &body[s..],
        ),
        None => ("200 OK", String::new(), body),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{extra}Accept-Ranges: bytes\r\nConnection: close\r\n\r\n",
        slice.len(),
    );
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    let limit = match (opts.truncate_first_at, opts.truncate_each_at) {
        (Some(n), _) if request_index == 0 => n.min(slice.len()),
        (_, Some(n)) => n.min(slice.len()),
        _ => slice.len(),
    };

    for chunk in slice[..limit].chunks(8192) {
        if stream.write_all(chunk).is_err() {
            return;
        }
        if let Some(delay) = opts.chunk_delay {
            let _ = stream.flush();
            thread::sleep(delay);
        }
    }
    let _ = stream.flush();
}

/// Returns the method and the raw value of the `Range` header.
fn parse_request(request: &str) -> (&str, Option<&str>) {
    let mut method = "";
    let mut range = None;

    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim());
            }
        }
    }

    (method, range)
}

/// Parses the start of an open-ended `bytes=N-` range.
fn parse_range_start(value: &str) -> Option<usize> {
    let part = value.strip_prefix("bytes=")?;
    let (start, _) = part.split_once('-')?;
    start.trim().parse().ok()
}

//! Minimal HTTP/1.1 registry server for integration tests.
//!
//! Serves `GET /v2/`, manifest GETs (by tag or digest, with
//! `Docker-Content-Digest`) and blob GETs with optional Range support.
//! Behavior knobs cover the awkward servers the engine must survive:
//! ranges ignored, transient 500s, corrupted blob bytes, slow bodies.

use docker_image_fetcher::digest::DigestUtils;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// One image the registry knows about, with a pre-built manifest.
pub struct MockImage {
    pub repository: String,
    pub tag: String,
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
    pub manifest_json: Vec<u8>,
    pub manifest_digest: String,
}

impl MockImage {
    fn find_blob(&self, digest: &str) -> Option<&[u8]> {
        if DigestUtils::compute_registry_digest(&self.config) == digest {
            return Some(&self.config);
        }
        self.layers
            .iter()
            .map(|l| l.as_slice())
            .find(|l| DigestUtils::compute_registry_digest(l) == digest)
    }
}

/// Build an image with a valid Docker v2 manifest over the given bytes.
pub fn build_image(repository: &str, tag: &str, config: Vec<u8>, layers: Vec<Vec<u8>>) -> MockImage {
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": config.len(),
            "digest": DigestUtils::compute_registry_digest(&config),
        },
        "layers": layers.iter().map(|layer| serde_json::json!({
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "size": layer.len(),
            "digest": DigestUtils::compute_registry_digest(layer),
        })).collect::<Vec<_>>(),
    });
    let manifest_json = serde_json::to_vec(&manifest).unwrap();
    let manifest_digest = DigestUtils::compute_registry_digest(&manifest_json);

    MockImage {
        repository: repository.to_string(),
        tag: tag.to_string(),
        config,
        layers,
        manifest_json,
        manifest_digest,
    }
}

/// Deterministic filler bytes for layer content.
pub fn layer_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[derive(Clone)]
pub struct MockRegistryOptions {
    /// When false, GET ignores Range and always answers 200 with the full body.
    pub support_ranges: bool,
    /// Sleep between body chunks to simulate a slow network.
    pub chunk_delay: Option<Duration>,
    /// Body chunk size.
    pub chunk_size: usize,
    /// The first N blob GETs answer 500.
    pub blob_failures: usize,
    /// Serve flipped bytes (same length) for this blob digest.
    pub corrupt_digest: Option<String>,
}

impl Default for MockRegistryOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            chunk_delay: None,
            chunk_size: 8 * 1024,
            blob_failures: 0,
            corrupt_digest: None,
        }
    }
}

pub struct MockRegistry {
    pub base_url: String,
}

/// Start the registry in background threads; it serves until the process
/// exits.
pub fn start(images: Vec<MockImage>, opts: MockRegistryOptions) -> MockRegistry {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let images = Arc::new(images);
    let failures = Arc::new(AtomicUsize::new(opts.blob_failures));

    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let images = Arc::clone(&images);
            let failures = Arc::clone(&failures);
            let opts = opts.clone();
            thread::spawn(move || handle(stream, &images, &opts, &failures));
        }
    });

    MockRegistry {
        base_url: format!("http://127.0.0.1:{}", port),
    }
}

enum Route {
    Ping,
    Manifest { repository: String, reference: String },
    Blob { repository: String, digest: String },
    Unknown,
}

fn parse_route(path: &str) -> Route {
    let Some(rest) = path.strip_prefix("/v2/") else {
        return Route::Unknown;
    };
    if rest.is_empty() {
        return Route::Ping;
    }
    if let Some(pos) = rest.find("/manifests/") {
        return Route::Manifest {
            repository: rest[..pos].to_string(),
            reference: rest[pos + "/manifests/".len()..].to_string(),
        };
    }
    if let Some(pos) = rest.find("/blobs/") {
        return Route::Blob {
            repository: rest[..pos].to_string(),
            digest: rest[pos + "/blobs/".len()..].to_string(),
        };
    }
    Route::Unknown
}

fn handle(
    mut stream: TcpStream,
    images: &[MockImage],
    opts: &MockRegistryOptions,
    failures: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                raw.extend_from_slice(&buf[..n]);
                if raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
                if raw.len() > 64 * 1024 {
                    return;
                }
            }
            Err(_) => return,
        }
    }
    let Ok(request) = std::str::from_utf8(&raw) else {
        return;
    };

    let mut lines = request.lines();
    let Some(request_line) = lines.next() else {
        return;
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return;
    };
    if !method.eq_ignore_ascii_case("GET") {
        respond(&mut stream, "405 Method Not Allowed", &[], b"", opts, false);
        return;
    }

    let range_offset = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                let spec = value.strip_prefix("bytes=")?;
                let (start, _) = spec.split_once('-')?;
                start.parse::<u64>().ok()
            } else {
                None
            }
        })
        .next();

    match parse_route(path) {
        Route::Ping => {
            let headers = [("Content-Type".to_string(), "application/json".to_string())];
            respond(&mut stream, "200 OK", &headers, b"{}", opts, false);
        }
        Route::Manifest {
            repository,
            reference,
        } => {
            let image = images.iter().find(|img| {
                img.repository == repository
                    && (img.tag == reference || img.manifest_digest == reference)
            });
            match image {
                Some(image) => {
                    let headers = [
                        ("Content-Type".to_string(), DOCKER_MANIFEST.to_string()),
                        (
                            "Docker-Content-Digest".to_string(),
                            image.manifest_digest.clone(),
                        ),
                    ];
                    respond(
                        &mut stream,
                        "200 OK",
                        &headers,
                        &image.manifest_json,
                        opts,
                        false,
                    );
                }
                None => {
                    respond(
                        &mut stream,
                        "404 Not Found",
                        &[],
                        br#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#,
                        opts,
                        false,
                    );
                }
            }
        }
        Route::Blob { repository, digest } => {
            let blob = images
                .iter()
                .find(|img| img.repository == repository)
                .and_then(|img| img.find_blob(&digest));
            let Some(blob) = blob else {
                respond(
                    &mut stream,
                    "404 Not Found",
                    &[],
                    br#"{"errors":[{"code":"BLOB_UNKNOWN"}]}"#,
                    opts,
                    false,
                );
                return;
            };

            if failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                respond(&mut stream, "500 Internal Server Error", &[], b"boom", opts, false);
                return;
            }

            let mut body = blob.to_vec();
            if opts.corrupt_digest.as_deref() == Some(digest.as_str()) && !body.is_empty() {
                body[0] ^= 0xff;
            }

            match range_offset {
                Some(offset) if opts.support_ranges && offset > 0 => {
                    let total = body.len() as u64;
                    let offset = offset.min(total);
                    let slice = body[offset as usize..].to_vec();
                    let headers = [(
                        "Content-Range".to_string(),
                        format!("bytes {}-{}/{}", offset, total.saturating_sub(1), total),
                    )];
                    respond(
                        &mut stream,
                        "206 Partial Content",
                        &headers,
                        &slice,
                        opts,
                        true,
                    );
                }
                _ => {
                    respond(&mut stream, "200 OK", &[], &body, opts, true);
                }
            }
        }
        Route::Unknown => {
            respond(&mut stream, "404 Not Found", &[], b"", opts, false);
        }
    }
}

fn respond(
    stream: &mut TcpStream,
    status: &str,
    headers: &[(String, String)],
    body: &[u8],
    opts: &MockRegistryOptions,
    throttle: bool,
) {
    let mut head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        body.len()
    );
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }
    for chunk in body.chunks(opts.chunk_size.max(1)) {
        if stream.write_all(chunk).is_err() {
            return;
        }
        if throttle {
            if let Some(delay) = opts.chunk_delay {
                let _ = stream.flush();
                thread::sleep(delay);
            }
        }
    }
    let _ = stream.flush();
}

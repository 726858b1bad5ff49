//! The HTTP cache backend (§4.9): one tarball per key at
//! `<root-url>/<hex(fingerprint)>`, fetched/stored with `curl`.

use std::io::Read;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::cache::{tarball, ArtifactMetadata, Cache, RetrieveOutcome, RetrieveRequest, StoreRequest};
use crate::label::Label;

/// A small hand-rolled counting semaphore — curl's blocking client has no
/// async concurrency limit of its own, so backpressure on concurrent
/// requests is this backend's job (§9: "no new dependency needed").
struct Semaphore {
    available: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Semaphore {
        Semaphore {
            available: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut avail = self.available.lock().unwrap();
        while *avail == 0 {
            avail = self.cond.wait(avail).unwrap();
        }
        *avail -= 1;
        SemaphoreGuard { sem: self }
    }
}

struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        *self.sem.available.lock().unwrap() += 1;
        self.sem.cond.notify_one();
    }
}

pub struct HttpCache {
    root_url: String,
    semaphore: Semaphore,
    max_retries: u32,
}

impl HttpCache {
    pub fn new(root_url: String, max_concurrent_requests: usize, max_retries: u32) -> HttpCache {
        HttpCache {
            root_url,
            semaphore: Semaphore::new(max_concurrent_requests.max(1)),
            max_retries,
        }
    }

    fn url_for(&self, key: &please_util::Digest256) -> String {
        format!("{}/{}", self.root_url.trim_end_matches('/'), key.to_hex())
    }

    fn with_retries<T>(&self, mut attempt: impl FnMut() -> Result<T, curl::Error>) -> Result<T, curl::Error> {
        let mut tries = 0;
        loop {
            match attempt() {
                Ok(v) => return Ok(v),
                Err(e) if tries < self.max_retries => {
                    tries += 1;
                    let base_ms = 50u64 * (1u64 << tries.min(10));
                    let jitter_ms = rand::thread_rng().gen_range(0..base_ms / 2 + 1);
                    std::thread::sleep(Duration::from_millis(base_ms + jitter_ms));
                    tracing::warn!(attempt = tries, error = %e, "retrying http cache request");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn put(&self, url: &str, body: &[u8]) -> Result<u32, curl::Error> {
        let _permit = self.semaphore.acquire();
        self.with_retries(|| {
            let mut handle = curl::easy::Easy::new();
            handle.url(url)?;
            handle.put(true)?;
            handle.post_field_size(body.len() as u64)?;
            let mut data = body;
            handle.read_function(move |buf| Ok(data.read(buf).unwrap_or(0)))?;
            handle.perform()?;
            handle.response_code()
        })
    }

    fn get(&self, url: &str) -> Result<(u32, Vec<u8>), curl::Error> {
        let _permit = self.semaphore.acquire();
        self.with_retries(|| {
            let mut handle = curl::easy::Easy::new();
            handle.url(url)?;
            let mut buf = Vec::new();
            {
                let mut transfer = handle.transfer();
                transfer.write_function(|chunk| {
                    buf.extend_from_slice(chunk);
                    Ok(chunk.len())
                })?;
                transfer.perform()?;
            }
            let code = handle.response_code()?;
            Ok((code, buf))
        })
    }
}

impl Cache for HttpCache {
    fn store(&self, req: StoreRequest<'_>) {
        let url = self.url_for(req.key);
        let mut framed = Vec::new();
        if let Some(m) = &req.metadata {
            framed.extend_from_slice(&(m.0.len() as u64).to_le_bytes());
            framed.extend_from_slice(&m.0);
        } else {
            framed.extend_from_slice(&0u64.to_le_bytes());
        }
        let mut body = Vec::new();
        if let Err(e) = tarball::pack(&mut body, req.out_dir, req.files) {
            tracing::warn!(target = %req.label, error = %e, "failed to package outputs for http cache store");
            return;
        }
        framed.extend_from_slice(&body);

        match self.put(&url, &framed) {
            Ok(code) if (200..300).contains(&code) => {}
            Ok(code) => tracing::warn!(target = %req.label, status = code, "http cache store returned non-2xx"),
            Err(e) => tracing::warn!(target = %req.label, error = %e, "http cache store failed"),
        }
    }

    fn retrieve(&self, req: RetrieveRequest<'_>) -> RetrieveOutcome {
        let url = self.url_for(req.key);
        let (code, body) = match self.get(&url) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target = %req.label, error = %e, "http cache retrieve failed, treating as miss");
                return RetrieveOutcome::Miss;
            }
        };

        if code == 404 {
            return RetrieveOutcome::Miss;
        }
        if !(200..300).contains(&code) {
            tracing::warn!(target = %req.label, status = code, "http cache returned unexpected status, treating as miss");
            return RetrieveOutcome::Miss;
        }
        if body.len() < 8 {
            tracing::warn!(target = %req.label, "http cache payload too short, treating as miss");
            return RetrieveOutcome::Miss;
        }

        let meta_len = u64::from_le_bytes(body[0..8].try_into().unwrap()) as usize;
        if body.len() < 8 + meta_len {
            tracing::warn!(target = %req.label, "http cache payload truncated, treating as miss");
            return RetrieveOutcome::Miss;
        }
        let metadata = if meta_len > 0 {
            Some(ArtifactMetadata(body[8..8 + meta_len].to_vec()))
        } else {
            None
        };

        for f in req.files {
            let _ = please_util::remove_existing(&req.out_dir.join(f));
        }
        if let Err(e) = tarball::unpack(&body[8 + meta_len..], req.out_dir) {
            tracing::warn!(target = %req.label, error = %e, "http cache payload corrupt, treating as miss");
            return RetrieveOutcome::Miss;
        }
        for f in req.files {
            let _ = please_util::set_cache_output_mode(&req.out_dir.join(f), req.is_binary);
        }
        RetrieveOutcome::Hit(metadata)
    }

    /// Not supported by this backend (§4.9); best-effort only, never relied
    /// upon for correctness.
    fn clean(&self, _label: &Label) {}
    fn clean_all(&self) {}
    fn shutdown(&self) {}
}

//! Lease-style locks guarding the allocation critical section.
//!
//! A lease is an atomic set-if-absent with a deadline plus a token-checked
//! release. Two flavours ship here: [`MemoryLock`] for a single process, and
//! [`FileLock`] for independent processes sharing a directory.

use std::{
    fs,
    io::{ErrorKind, Write},
};

use parking_lot::Mutex;

use crate::helpe::*;

/// How the coordinator goes about getting the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    pub key:            String,
    /// Lease lifetime. A holder that dies keeps everybody out for at most
    /// this long.
    pub ttl:            Duration,
    /// Give up with [`PoolError::LockTimeout`] after waiting this long.
    pub timeout:        Duration,
    /// Pause between attempts is drawn uniformly from this window so that
    /// contenders spread out.
    pub backoff_min:    Duration,
    pub backoff_max:    Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            key:            String::from("lock:block-assignment"),
            ttl:            Duration::from_millis(5_000),
            timeout:        Duration::from_millis(2_000),
            backoff_min:    Duration::from_millis(100),
            backoff_max:    Duration::from_millis(200),
        }
    }
}

impl LockPolicy {
    fn backoff(&self) -> Duration {
        let lo = self.backoff_min.as_millis() as u64;
        let hi = (self.backoff_max.as_millis() as u64).max(lo);
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Proof of holding a lease. The lease is given back when the guard is
/// dropped, whichever way the holder leaves its scope: return, `?` or
/// panic.
pub struct LockGuard<'a, L: AllocLock + ?Sized> {
    lock:           &'a L,
    key:            String,
    token:          Option<LockToken>,
    ttl:            Duration,
    acquired_at:    Instant,
}

impl<'a, L: AllocLock + ?Sized> LockGuard<'a, L> {
    /// Keeps trying to take `policy.key` until it succeeds or
    /// `policy.timeout` runs out. There is always at least one attempt.
    pub fn acquire(lock: &'a L, policy: &LockPolicy) -> PoolResult<Self> {
        let started = Instant::now();
        loop {
            if let Some(token) = lock.acquire(&policy.key, policy.ttl)? {
                debug!(key = %policy.key, waited = ?started.elapsed(), "lock acquired");
                break Ok(Self {
                    lock,
                    key:            policy.key.clone(),
                    token:          Some(token),
                    ttl:            policy.ttl,
                    acquired_at:    Instant::now(),
                });
            }
            let waited = started.elapsed();
            if waited >= policy.timeout {
                break Err(PoolError::LockTimeout {
                    key: policy.key.clone(),
                    waited,
                });
            }
            std::thread::sleep(policy.backoff().min(policy.timeout - waited));
        }
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Whether the lease may already have lapsed under our feet.
    pub fn outlived_ttl(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }

    /// Gives the lease back now. Returns `false` if it had lapsed already.
    pub fn release(mut self) -> PoolResult<bool> {
        match self.token.take() {
            Some(token) => self.lock.release(&self.key, &token),
            None        => Ok(false),
        }
    }
}

impl<L: AllocLock + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            match self.lock.release(&self.key, &token) {
                Ok(true)    => { debug!(key = %self.key, "lock released"); },
                Ok(false)   => {
                    warn!(key = %self.key, held = ?self.acquired_at.elapsed(), "lock lapsed before release");
                },
                Err(e)      => { warn!(key = %self.key, error = %e, "lock release failed"); },
            }
        }
    }
}

/// In-process leases.
#[derive(Default)]
pub struct MemoryLock {
    leases: Mutex<HashMap<String, (LockToken, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AllocLock for MemoryLock {
    fn acquire(&self, key: &str, ttl: Duration) -> PoolResult<Option<LockToken>> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some((_, deadline)) = leases.get(key) {
            if *deadline > now {
                return Ok(None);
            }
        }
        let token = LockToken::generate();
        leases.insert(key.to_owned(), (token.clone(), now + ttl));

        Ok(Some(token))
    }

    fn release(&self, key: &str, token: &LockToken) -> PoolResult<bool> {
        let mut leases = self.leases.lock();
        match leases.get(key) {
            Some((held, deadline)) if held == token && *deadline > Instant::now() => {
                leases.remove(key);
                Ok(true)
            },
            _   => Ok(false),
        }
    }
}

/// Leases as files, one generation at a time: `<dir>/<key>.<gen>.lock`
/// holds the token and deadline (Unix milliseconds) of generation `gen`.
///
/// The highest generation on disk is the current lease. It is free once its
/// deadline has passed or once a `<key>.<gen>.released` marker sits next to
/// it. Taking the key means linking generation `top + 1` into place: the
/// lease is written in full under a private name and then hard-linked, and
/// linking fails if the target exists, so exactly one contender wins each
/// generation. The current lease file is never renamed or deleted. Only
/// generations two or more below the top are swept away.
///
/// A contender acting on a view old enough to predate a sweep can link a
/// generation that was already swept. It finds a higher one on disk right
/// after linking and backs off.
pub struct FileLock {
    dir:    PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
struct Lease {
    token:          LockToken,
    deadline_ms:    i64,
}

impl Lease {
    fn encode(&self) -> String {
        format!("{}\n{}\n", self.token.0, self.deadline_ms)
    }

    fn decode(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let token = LockToken(lines.next()?.trim().to_owned());
        let deadline_ms = lines.next()?.trim().parse().ok()?;

        Some(Self { token, deadline_ms })
    }
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>) -> PoolResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem_of(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect()
    }

    fn lease_path(&self, stem: &str, gen: u64) -> PathBuf {
        self.dir.join(format!("{stem}.{gen}.lock"))
    }

    fn released_path(&self, stem: &str, gen: u64) -> PathBuf {
        self.dir.join(format!("{stem}.{gen}.released"))
    }

    /// Generations of `stem` on disk, as `(gen, path)` for both lease files
    /// and release markers.
    fn generations(&self, stem: &str) -> PoolResult<Vec<(u64, PathBuf)>> {
        let prefix = format!("{stem}.");
        let mut found = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(rest) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else { continue };
            let Some(gen) = rest.strip_suffix(".lock")
                .or_else(|| rest.strip_suffix(".released"))
                .and_then(|g| g.parse::<u64>().ok())
            else { continue };
            found.push((gen, entry.path()));
        }

        Ok(found)
    }

    /// The current generation of `stem`, 0 if it was never taken.
    fn top_generation(&self, stem: &str) -> PoolResult<u64> {
        Ok(self.generations(stem)?
            .into_iter()
            .map(|(gen, _)| gen)
            .max()
            .unwrap_or(0))
    }

    fn read_lease(path: &Path) -> PoolResult<Option<Lease>> {
        match fs::read_to_string(path) {
            // A garbled lease counts as lapsed.
            Ok(text)    => Ok(Some(Lease::decode(&text).unwrap_or(Lease {
                token:          LockToken(String::new()),
                deadline_ms:    i64::MIN,
            }))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e)      => Err(e.into()),
        }
    }

    /// The lease of generation `gen` if it still holds the key.
    fn live_lease(&self, stem: &str, gen: u64) -> PoolResult<Option<Lease>> {
        if gen == 0 || self.released_path(stem, gen).exists() {
            return Ok(None);
        }
        let now = Utc::now().timestamp_millis();

        Ok(Self::read_lease(&self.lease_path(stem, gen))?.filter(|l| l.deadline_ms > now))
    }

    fn try_link(&self, path: &Path, lease: &Lease) -> PoolResult<bool> {
        let staged = self.dir.join(format!("{}.new", lease.token.0));
        {
            let mut f = fs::File::create(&staged)?;
            f.write_all(lease.encode().as_bytes())?;
            f.sync_all()?;
        }
        let linked = fs::hard_link(&staged, path);
        fs::remove_file(&staged)?;
        match linked {
            Ok(())  => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e)  => Err(e.into()),
        }
    }

    /// Tries to become generation `seen + 1`, `seen` being the generation
    /// the caller found free.
    fn claim(&self, stem: &str, seen: u64, lease: &Lease) -> PoolResult<bool> {
        let gen = seen + 1;
        let path = self.lease_path(stem, gen);
        if !self.try_link(&path, lease)? {
            return Ok(false);
        }
        let top = self.top_generation(stem)?;
        if top > gen {
            debug!(stem, gen, top, "claimed a swept generation, backing off");
            fs::remove_file(&path)?;
            return Ok(false);
        }
        self.sweep(stem, gen)?;

        Ok(true)
    }

    /// Drops everything of `stem` older than the generation below `gen`.
    fn sweep(&self, stem: &str, gen: u64) -> PoolResult<()> {
        for (old, path) in self.generations(stem)? {
            if old + 1 >= gen { continue; }
            match fs::remove_file(&path) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    warn!(path = %path.display(), error = %e, "could not sweep old lease");
                },
                _   => {},
            }
        }

        Ok(())
    }
}

impl AllocLock for FileLock {
    fn acquire(&self, key: &str, ttl: Duration) -> PoolResult<Option<LockToken>> {
        let stem = Self::stem_of(key);
        let top = self.top_generation(&stem)?;
        if self.live_lease(&stem, top)?.is_some() {
            return Ok(None);
        }
        let lease = Lease {
            token:          LockToken::generate(),
            deadline_ms:    Utc::now().timestamp_millis() + ttl.as_millis() as i64,
        };
        if !self.claim(&stem, top, &lease)? {
            return Ok(None);
        }
        debug!(key, generation = top + 1, "lease taken");

        Ok(Some(lease.token))
    }

    fn release(&self, key: &str, token: &LockToken) -> PoolResult<bool> {
        let stem = Self::stem_of(key);
        let top = self.top_generation(&stem)?;
        match self.live_lease(&stem, top)? {
            Some(held) if &held.token == token => {},
            // Lapsed or taken over.
            _   => return Ok(false),
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.released_path(&stem, top))
        {
            Ok(_)   => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e)  => Err(e.into()),
        }
    }
}

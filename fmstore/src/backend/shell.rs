use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

use super::{StorageBackend, mismatch, stream_copy};
use crate::cache::{CacheOp, CacheRegistry, CachedMeta};
use crate::cadapter::{RemoteShell, ShellOutput};
use crate::error::{Result, StorageError};
use crate::invalidation::invalidate_location;
use crate::locator::{Locator, Scheme, ShellLocator};
use crate::types::{DirEntry, EntryKind, Metadata};

/// Remote filesystem driven through shell commands (`ls`, `cat`, `mkdir`,
/// `rm`). Results are cached in namespace `ssh:<host>`, keyed by path.
pub struct ShellBackend {
    shell: Arc<dyn RemoteShell>,
    registry: Arc<CacheRegistry>,
}

impl ShellBackend {
    pub fn new(shell: Arc<dyn RemoteShell>, registry: Arc<CacheRegistry>) -> Self {
        Self { shell, registry }
    }

    fn locator<'a>(&self, loc: &'a Locator) -> Result<&'a ShellLocator> {
        match loc {
            Locator::RemoteShell(s) => Ok(s),
            other => Err(mismatch(Scheme::RemoteShell, other)),
        }
    }

    async fn run(&self, s: &ShellLocator, command: String, stdin: Option<&[u8]>) -> Result<ShellOutput> {
        let out = self.shell.run(&s.host, &command, stdin).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(classify_failure(s, &out))
        }
    }

    /// Runs `ls` with `-L` so symlinks report their target, as local stats
    /// do. `-L` fails on a dangling link; the plain form then reports the
    /// link itself.
    async fn ls_following(&self, s: &ShellLocator, flags: &str, target: &str) -> Result<ShellOutput> {
        match self.run(s, format!("LC_ALL=C ls {flags}L -- {target}"), None).await {
            Err(e) if e.is_not_found() => {
                tracing::debug!("ls -L failed for {target}, retrying without following links");
                self.run(s, format!("LC_ALL=C ls {flags} -- {target}"), None).await
            }
            other => other,
        }
    }

    fn forget(&self, loc: &Locator) {
        if let Err(err) = invalidate_location(&self.registry, loc) {
            tracing::warn!("cache invalidation for {loc} failed: {err}");
        }
    }
}

fn classify_failure(s: &ShellLocator, out: &ShellOutput) -> StorageError {
    let what = format!("ssh://{}{}", s.host, s.path);
    let stderr = out.stderr.trim();
    if stderr.contains("No such file") {
        StorageError::NotFound(what)
    } else if stderr.contains("Permission denied") {
        StorageError::PermissionDenied(what)
    } else if stderr.contains("File exists") {
        StorageError::AlreadyExists(what)
    } else {
        StorageError::Other(format!("{what}: exit {}: {stderr}", out.status))
    }
}

/// Single-quotes `s` for a POSIX shell.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Splits off the first `n` whitespace-separated fields and returns them with
/// the untouched remainder of the line.
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while fields.len() < n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

fn parse_mode(perms: &str) -> u32 {
    let bits = perms.as_bytes().get(1..10).unwrap_or_default();
    let mut mode = 0;
    for (i, c) in bits.iter().enumerate() {
        let shift = 8 - i as u32;
        if !matches!(c, b'-' | b'S' | b'T') {
            mode |= 1 << shift;
        }
    }
    mode
}

/// `ls -l` timestamps: `Mon DD HH:MM` within the last half year, otherwise
/// `Mon DD YYYY`. Interpreted in the local timezone.
pub fn parse_ls_time(month: &str, day: &str, time_or_year: &str, now: NaiveDateTime) -> Option<SystemTime> {
    let naive = if time_or_year.contains(':') {
        let time = NaiveTime::parse_from_str(time_or_year, "%H:%M").ok()?;
        let date = NaiveDate::parse_from_str(&format!("{month} {day} {}", now.year()), "%b %d %Y").ok()?;
        let mut stamp = date.and_time(time);
        // a date "in the future" belongs to last year
        if stamp > now + chrono::Duration::days(1) {
            let prev = NaiveDate::parse_from_str(&format!("{month} {day} {}", now.year() - 1), "%b %d %Y").ok()?;
            stamp = prev.and_time(time);
        }
        stamp
    } else {
        NaiveDate::parse_from_str(&format!("{month} {day} {time_or_year}"), "%b %d %Y")
            .ok()?
            .and_hms_opt(0, 0, 0)?
    };
    Local.from_local_datetime(&naive).earliest().map(SystemTime::from)
}

/// Parses one `ls -la` line into a name and metadata. Returns `None` for the
/// `total` line and anything unparseable.
pub fn parse_ls_line(line: &str, now: NaiveDateTime) -> Option<(String, Metadata)> {
    let (fields, name) = split_fields(line, 8)?;
    let perms = fields[0];
    let kind = match perms.chars().next()? {
        'd' => EntryKind::Dir,
        'l' => EntryKind::Symlink,
        '-' => EntryKind::File,
        // devices, sockets and fifos surface as zero-sized files
        'c' | 'b' | 's' | 'p' => EntryKind::File,
        _ => return None,
    };
    let (size, month, day, stamp, name) = match fields[4].strip_suffix(',') {
        // device files print "major, minor" where the size would be
        Some(_) => {
            let (more, name) = split_fields(name, 1)?;
            (0, fields[6], fields[7], more[0], name)
        }
        None => (fields[4].parse::<u64>().ok()?, fields[5], fields[6], fields[7], name),
    };
    let name = match kind {
        EntryKind::Symlink => name.split(" -> ").next().unwrap_or(name),
        _ => name,
    };
    if name.is_empty() {
        return None;
    }
    let mtime = parse_ls_time(month, day, stamp, now)?;
    let meta = Metadata {
        kind,
        size: if kind == EntryKind::File { size } else { 0 },
        mtime,
        mode: None,
    }
    .with_mode(parse_mode(perms));
    Some((name.to_string(), meta))
}

fn child_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[async_trait]
impl StorageBackend for ShellBackend {
    fn scheme(&self) -> Scheme {
        Scheme::RemoteShell
    }

    async fn stat(&self, loc: &Locator) -> Result<Metadata> {
        let s = self.locator(loc)?;
        let ns = s.namespace();
        let cache = self.registry.metadata();
        match cache.get(CacheOp::Stat, &ns, &s.path) {
            Some(CachedMeta::Stat(meta)) => return Ok(meta),
            Some(CachedMeta::Missing) => return Err(StorageError::NotFound(loc.to_string())),
            _ => {}
        }

        let out = match self.ls_following(s, "-lad", &quote(&s.path)).await {
            Ok(out) => out,
            Err(e) if e.is_not_found() => {
                cache.put_with_ttl(CacheOp::Stat, &ns, &s.path, CachedMeta::Missing, cache.error_ttl());
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let now = Local::now().naive_local();
        let meta = out
            .stdout_lossy()
            .lines()
            .find_map(|line| parse_ls_line(line, now))
            .map(|(_, meta)| meta)
            .ok_or_else(|| StorageError::Other(format!("unparseable ls output for {loc}")))?;
        cache.put(CacheOp::Stat, &ns, &s.path, CachedMeta::Stat(meta.clone()));
        Ok(meta)
    }

    async fn iterdir(&self, loc: &Locator) -> Result<Vec<DirEntry>> {
        let s = self.locator(loc)?;
        let ns = s.namespace();
        let cache = self.registry.metadata();
        if let Some(CachedMeta::Listing(entries)) = cache.get(CacheOp::Listing, &ns, &s.path) {
            return Ok(entries.as_ref().clone());
        }

        let out = self
            .ls_following(s, "-la", &format!("{}/", quote(&s.path)))
            .await?;
        let now = Local::now().naive_local();
        let entries: Vec<DirEntry> = out
            .stdout_lossy()
            .lines()
            .filter_map(|line| parse_ls_line(line, now))
            .filter(|(name, _)| name != "." && name != "..")
            .map(|(name, meta)| DirEntry::new(name, meta))
            .collect();

        for entry in &entries {
            let child = child_path(&s.path, &entry.name);
            cache.put(CacheOp::Stat, &ns, &child, CachedMeta::Stat(entry.metadata.clone()));
        }
        cache.put(CacheOp::Listing, &ns, &s.path, CachedMeta::Listing(Arc::new(entries.clone())));
        Ok(entries)
    }

    async fn read(&self, loc: &Locator) -> Result<Vec<u8>> {
        let s = self.locator(loc)?;
        let out = self.run(s, format!("cat -- {}", quote(&s.path)), None).await?;
        Ok(out.stdout)
    }

    async fn write(&self, loc: &Locator, data: &[u8]) -> Result<()> {
        let s = self.locator(loc)?;
        self.run(s, format!("cat > {}", quote(&s.path)), Some(data)).await?;
        self.forget(loc);
        Ok(())
    }

    async fn mkdir(&self, loc: &Locator, exist_ok: bool) -> Result<()> {
        let s = self.locator(loc)?;
        let flag = if exist_ok { "-p " } else { "" };
        self.run(s, format!("mkdir {flag}-- {}", quote(&s.path)), None).await?;
        self.forget(loc);
        Ok(())
    }

    async fn delete(&self, loc: &Locator) -> Result<()> {
        let s = self.locator(loc)?;
        if s.path == "/" {
            return Err(StorageError::UnsupportedOperation(format!("refusing to delete {loc}")));
        }
        // surface NotFound instead of letting `rm -f` swallow it
        self.stat(loc).await?;
        self.run(s, format!("rm -rf -- {}", quote(&s.path)), None).await?;
        self.forget(loc);
        Ok(())
    }

    async fn copy_to(&self, src: &Locator, dest: &dyn StorageBackend, dst: &Locator) -> Result<()> {
        stream_copy(self, src, dest, dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use std::sync::Mutex;

    const LISTING: &str = "total 16
drwxr-xr-x  3 alice staff  4096 Mar  3 10:15 .
drwxr-xr-x 12 alice staff  4096 Jan  9  2023 ..
-rw-r--r--  1 alice staff   123 Mar  3 09:00 notes.txt
drwx------  2 alice staff  4096 Feb 28  2024 my docs
lrwxrwxrwx  1 alice staff     9 Mar  3 10:15 latest -> notes.txt
crw-rw-rw-  1 root  wheel  1,   3 Mar  1 08:00 null
";

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn parses_long_listing() {
        let parsed: Vec<(String, Metadata)> =
            LISTING.lines().filter_map(|l| parse_ls_line(l, now())).collect();
        let names: Vec<&str> = parsed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![".", "..", "notes.txt", "my docs", "latest", "null"]);

        let notes = &parsed[2].1;
        assert!(notes.is_file());
        assert_eq!(notes.size, 123);
        assert_eq!(notes.mode, Some(0o644));
        assert!(parsed[3].1.is_dir());
        assert_eq!(parsed[3].1.mode, Some(0o700));
        assert!(parsed[4].1.is_symlink());
        assert_eq!(parsed[5].1.size, 0);
    }

    #[test]
    fn ls_times_resolve_year() {
        let jan = parse_ls_time("Jan", "15", "2023", now()).unwrap();
        let expected: SystemTime = Local
            .with_ymd_and_hms(2023, 1, 15, 0, 0, 0)
            .earliest()
            .unwrap()
            .into();
        assert_eq!(jan, expected);

        // December seen in March is last December
        let dec = parse_ls_time("Dec", "24", "18:30", now()).unwrap();
        let expected: SystemTime = Local
            .with_ymd_and_hms(2024, 12, 24, 18, 30, 0)
            .earliest()
            .unwrap()
            .into();
        assert_eq!(dec, expected);
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(quote("/tmp/it's"), r"'/tmp/it'\''s'");
    }

    /// Replays canned output and records the commands it was asked to run.
    struct ScriptedShell {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteShell for ScriptedShell {
        async fn run(&self, _host: &str, command: &str, _stdin: Option<&[u8]>) -> Result<ShellOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            let (status, stdout, stderr) = if command.starts_with("LC_ALL=C ls -laL ") {
                (0, LISTING.to_string(), String::new())
            } else if command == "LC_ALL=C ls -ladL -- '/home/alice/latest'" {
                (0, "-rw-r--r-- 1 alice staff 123 Mar  3 09:00 /home/alice/latest".to_string(), String::new())
            } else if command == "LC_ALL=C ls -lad -- '/home/alice/broken'" {
                let line = "lrwxrwxrwx 1 alice staff 4 Mar  3 10:15 /home/alice/broken -> gone";
                (0, line.to_string(), String::new())
            } else if command.contains("'/home/alice/missing'") || command.contains("ls -ladL -- '/home/alice/broken'") {
                (2, String::new(), "ls: cannot access: No such file or directory".to_string())
            } else {
                (0, String::new(), String::new())
            };
            Ok(ShellOutput {
                status,
                stdout: stdout.into_bytes(),
                stderr,
            })
        }
    }

    fn backend() -> (ShellBackend, Arc<ScriptedShell>) {
        let shell = Arc::new(ScriptedShell {
            commands: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(CacheRegistry::new(&StoreConfig::default()));
        (ShellBackend::new(shell.clone(), registry), shell)
    }

    #[tokio::test]
    async fn listing_answers_child_stats() {
        let (backend, shell) = backend();
        let dir = Locator::shell("box", "/home/alice");
        let entries = backend.iterdir(&dir).await.unwrap();
        assert_eq!(entries.len(), 4);

        let notes = backend.stat(&dir.join("notes.txt")).await.unwrap();
        assert_eq!(notes.size, 123);
        backend.iterdir(&dir).await.unwrap();
        assert_eq!(shell.commands.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_path_is_not_found_and_cached() {
        let (backend, shell) = backend();
        let loc = Locator::shell("box", "/home/alice/missing");
        assert!(!backend.exists(&loc).await.unwrap());
        assert!(!backend.exists(&loc).await.unwrap());
        // `ls -ladL` then the plain fallback, both once
        assert_eq!(shell.commands.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stat_follows_symlinks_like_local() {
        let (backend, _) = backend();
        let link = backend.stat(&Locator::shell("box", "/home/alice/latest")).await.unwrap();
        assert_eq!(link.kind, EntryKind::File);
        assert_eq!(link.size, 123);

        let dangling = backend.stat(&Locator::shell("box", "/home/alice/broken")).await.unwrap();
        assert_eq!(dangling.kind, EntryKind::Symlink);
    }

    #[tokio::test]
    async fn write_invalidates_parent_listing() {
        let (backend, shell) = backend();
        let dir = Locator::shell("box", "/home/alice");
        backend.iterdir(&dir).await.unwrap();
        backend.write(&dir.join("new.txt"), b"data").await.unwrap();
        backend.iterdir(&dir).await.unwrap();

        let commands = shell.commands.lock().unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[1], "cat > '/home/alice/new.txt'");
    }
}

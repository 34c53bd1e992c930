//! Process logging.
//!
//! Every line is written as `[L][timestamp][rank N] message key=value` to
//! stdout and, once [`log_to_file`] ran, appended to `runtime.log` too. The
//! rank tag is per thread so ranks running as threads of one process can be
//! told apart.

use std::{
    cell::Cell,
    fmt::Write as _,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use env_logger::{Builder, Env, Target};
use log::kv::{self, Key, Value, VisitSource};
use parking_lot::{Mutex, const_mutex};

/// Name of the log file inside the output directory.
pub const LOG_FILE_NAME: &str = "runtime.log";

static LOG_FILE: Mutex<Option<(PathBuf, File)>> = const_mutex(None);

thread_local! {
    static RANK: Cell<Option<RankTag>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy)]
struct RankTag {
    rank: usize,
    leader: bool,
}

/// Installs the process logger, `info` unless `RUST_LOG` says otherwise.
///
/// Calling it more than once is harmless.
pub fn init() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    builder
        .target(Target::Pipe(Box::new(Tee)))
        .format(|buf, record| {
            let rank = RANK
                .with(Cell::get)
                .map_or_else(|| "-".to_string(), |tag| tag.rank.to_string());

            let mut pairs = Pairs(String::new());
            let _ = record.key_values().visit(&mut pairs);

            writeln!(
                buf,
                "[{}][{}][rank {rank}] {}{}",
                &record.level().as_str()[..1],
                buf.timestamp_millis(),
                record.args(),
                pairs.0
            )
        });

    let _ = builder.try_init();
}

/// Tags every line this thread logs with `rank`.
///
/// # Arguments
/// * `rank` - The global rank of the calling thread.
/// * `leader` - Whether the rank prints the leader-only lines.
pub fn set_rank(rank: usize, leader: bool) {
    RANK.with(|tag| tag.set(Some(RankTag { rank, leader })));
}

/// Removes this thread's rank tag.
pub fn clear_rank() {
    RANK.with(|tag| tag.set(None));
}

/// Whether the calling thread logs leader-only lines.
pub fn is_leader() -> bool {
    RANK.with(Cell::get).is_some_and(|tag| tag.leader)
}

/// Starts appending every line to `runtime.log` inside `dir`.
///
/// The file is process wide, ranks sharing a process keep the handle the
/// first of them opened.
///
/// # Arguments
/// * `dir` - An existing directory.
/// * `create` - Whether the file may be created, only the leader does so.
///
/// # Returns
/// The path of the log file.
pub fn log_to_file(dir: &Path, create: bool) -> io::Result<PathBuf> {
    let path = dir.join(LOG_FILE_NAME);
    let mut current = LOG_FILE.lock();
    if current.as_ref().is_some_and(|(open, _)| *open == path) {
        return Ok(path);
    }

    let file = OpenOptions::new().append(true).create(create).open(&path)?;
    *current = Some((path.clone(), file));
    Ok(path)
}

/// Logs at info level on the global leader only.
#[macro_export]
macro_rules! info0 {
    ($($arg:tt)+) => {
        if $crate::logging::is_leader() {
            ::log::info!($($arg)+);
        }
    };
}

struct Tee;

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Some((_, file)) = LOG_FILE.lock().as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Some((_, file)) = LOG_FILE.lock().as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

struct Pairs(String);

impl<'kvs> VisitSource<'kvs> for Pairs {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), kv::Error> {
        let _ = write!(self.0, " {key}={value}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_flag_is_per_thread() {
        set_rank(0, true);
        assert!(is_leader());

        let other = std::thread::spawn(|| {
            set_rank(1, false);
            is_leader()
        });
        assert!(!other.join().unwrap());

        clear_rank();
        assert!(!is_leader());
    }

    #[test]
    fn ranks_sharing_a_process_reuse_the_log_file() {
        let dir = std::env::temp_dir().join(format!("unet3d-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(LOG_FILE_NAME);
        let _ = std::fs::remove_file(&path);

        assert_eq!(
            log_to_file(&dir, false).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );

        assert_eq!(log_to_file(&dir, true).unwrap(), path);
        assert_eq!(log_to_file(&dir, false).unwrap(), path);
        assert_eq!(LOG_FILE.lock().as_ref().map(|(open, _)| open.clone()), Some(path));

        *LOG_FILE.lock() = None;
        std::fs::remove_dir_all(dir).unwrap();
    }
}

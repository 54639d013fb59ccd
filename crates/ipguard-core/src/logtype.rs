//! A (directory, filename-prefix, pattern-set) triple that groups many
//! rotated log files under one cache subdirectory.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregate;
use crate::cache::CacheRecord;
use crate::country::CountryResolver;
use crate::error::ConfigError;

/// Replace every `/` in `dir` with `:`, matching the stable, content-free
/// directory-name encoding used by [`LogType::cache_dirname`].
fn encode_dir(dir: &Path) -> String {
    dir.to_string_lossy().replace('/', ":")
}

fn patterns_md5_hex(sources: &[String]) -> String {
    let mut ctx = md5::Context::new();
    for s in sources {
        ctx.consume(s.as_bytes());
    }
    format!("{:x}", ctx.compute())
}

pub struct LogType {
    name: String,
    dir: PathBuf,
    prefix: String,
    patterns: Vec<Regex>,
    patterns_md5: String,
    cache_dirname: String,
    files: BTreeMap<String, CacheRecord>,
    offense_count_cache: OnceCell<usize>,
    parses_performed: usize,
}

impl LogType {
    /// Compile `pattern_sources`, compute this log type's stable cache
    /// directory name, ensure it exists, enumerate `dir` for files whose
    /// name starts with `prefix`, and for each one either load a cached
    /// record or parse it fresh and write the cache.
    pub fn construct(
        name: &str,
        dir: &Path,
        prefix: &str,
        pattern_sources: &[String],
        cache_root: &Path,
        country: &dyn CountryResolver,
    ) -> Result<Self, ConfigError> {
        let mut patterns = Vec::with_capacity(pattern_sources.len());
        for (index, src) in pattern_sources.iter().enumerate() {
            let re = Regex::new(src).map_err(|source| ConfigError::BadRegex {
                log_type: name.to_string(),
                index,
                source,
            })?;
            if re.captures_len() < 2 {
                return Err(ConfigError::MissingCaptureGroup {
                    log_type: name.to_string(),
                    index,
                    pattern: src.clone(),
                });
            }
            patterns.push(re);
        }

        let patterns_md5 = patterns_md5_hex(pattern_sources);
        let cache_dirname = format!("{};{};{}", encode_dir(dir), prefix, patterns_md5);
        let cache_subdir = cache_root.join(&cache_dirname);

        if let Err(e) = std::fs::create_dir_all(&cache_subdir) {
            warn!(dir = %cache_subdir.display(), error = %e, "failed to create cache subdirectory; entries will be reparsed every run");
        }

        let mut files = BTreeMap::new();
        let mut parses_performed = 0usize;

        let entries = match std::fs::read_dir(dir) {
            Ok(it) => it,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot enumerate log directory");
                return Ok(LogType {
                    name: name.to_string(),
                    dir: dir.to_path_buf(),
                    prefix: prefix.to_string(),
                    patterns,
                    patterns_md5,
                    cache_dirname,
                    files,
                    offense_count_cache: OnceCell::new(),
                    parses_performed,
                });
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name == "." || file_name == ".." || !file_name.starts_with(prefix) {
                continue;
            }
            let log_path = dir.join(file_name.as_ref());
            if !log_path.is_file() {
                continue;
            }

            let content_md5 = match CacheRecord::content_md5_of(&log_path) {
                Ok(h) => h,
                Err(e) => {
                    warn!(path = %log_path.display(), error = %e, "skipping unreadable log file");
                    continue;
                }
            };
            let content_md5_hex = hex_encode(&content_md5);
            let cache_path = cache_subdir.join(&content_md5_hex);

            let record = if cache_path.exists() {
                match CacheRecord::load_from_cache(&cache_path) {
                    Ok(mut r) => {
                        r.set_log_path(log_path.clone());
                        r
                    }
                    Err(e) => {
                        warn!(path = %cache_path.display(), error = %e, "cache file unreadable, reparsing");
                        parses_performed += 1;
                        let r =
                            CacheRecord::build_from_log(&log_path, &patterns, country)
                                .map_err(|e| {
                                    warn!(path = %log_path.display(), error = %e, "failed to parse log file");
                                    e
                                })
                                .ok();
                        match r {
                            Some(r) => {
                                if let Err(e) = r.write_cache(&cache_path) {
                                    warn!(path = %cache_path.display(), error = %e, "failed to write cache file; continuing with in-memory result");
                                }
                                r
                            }
                            None => continue,
                        }
                    }
                }
            } else {
                parses_performed += 1;
                let parsed = match CacheRecord::build_from_log(&log_path, &patterns, country) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(path = %log_path.display(), error = %e, "failed to parse log file, skipping");
                        continue;
                    }
                };
                if let Err(e) = parsed.write_cache(&cache_path) {
                    warn!(path = %cache_path.display(), error = %e, "failed to write cache file; continuing with in-memory result");
                }
                parsed
            };

            debug!(path = %log_path.display(), offenses = record.offense_count(), "scanned log file");
            files.insert(content_md5_hex, record);
        }

        // Sweep stale cache entries: anything on disk that isn't a
        // content hash we just saw belongs to a log file that has
        // rotated out of existence.
        if let Ok(entries) = std::fs::read_dir(&cache_subdir) {
            let mut removed = 0usize;
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') || files.contains_key(name.as_ref()) {
                    continue;
                }
                if std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
            if removed > 0 {
                info!(dir = %cache_subdir.display(), removed, "swept stale cache entries");
            }
        }

        Ok(LogType {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            patterns,
            patterns_md5,
            cache_dirname,
            files,
            offense_count_cache: OnceCell::new(),
            parses_performed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_dirname(&self) -> &str {
        &self.cache_dirname
    }

    pub fn patterns_md5(&self) -> &str {
        &self.patterns_md5
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of log files this invocation actually parsed (as opposed
    /// to loading from cache). Exposed for cache-idempotence tests.
    pub fn parses_performed(&self) -> usize {
        self.parses_performed
    }

    pub fn offense_count(&self) -> usize {
        *self
            .offense_count_cache
            .get_or_init(|| self.files.values().map(CacheRecord::offense_count).sum())
    }

    pub fn map_addresses(&self, aggregate: &mut Aggregate) {
        for record in self.files.values() {
            record.map_into(aggregate);
        }
    }
}

fn hex_encode(bytes: &[u8; 16]) -> String {
    format!("{:x}", md5::Digest(*bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::country::NullResolver;

    fn write_log(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn construct_parses_matching_files_and_skips_others() {
        let log_dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();

        write_log(
            log_dir.path(),
            "auth.log",
            "Failed password for root from 1.2.3.4\n\
             Failed password for root from 1.2.3.4\n\
             Failed password for root from 1.2.3.4\n",
        );
        write_log(log_dir.path(), "other.log", "Failed password from 9.9.9.9\n");

        let lt = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &[r"Failed password .* from (\S+)".to_string()],
            cache_root.path(),
            &NullResolver,
        )
        .unwrap();

        assert_eq!(lt.offense_count(), 3);
        assert_eq!(lt.parses_performed(), 1);

        let cache_subdir = cache_root.path().join(lt.cache_dirname());
        let entries: Vec<_> = std::fs::read_dir(&cache_subdir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rescan_with_unchanged_logs_does_not_reparse() {
        let log_dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();

        write_log(
            log_dir.path(),
            "auth.log",
            "Failed password for root from 1.2.3.4\n",
        );

        let patterns = vec![r"Failed password .* from (\S+)".to_string()];
        let first = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &patterns,
            cache_root.path(),
            &NullResolver,
        )
        .unwrap();
        assert_eq!(first.parses_performed(), 1);

        let second = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &patterns,
            cache_root.path(),
            &NullResolver,
        )
        .unwrap();
        assert_eq!(second.parses_performed(), 0);
        assert_eq!(second.offense_count(), 1);
    }

    #[test]
    fn content_change_invalidates_cache_and_sweeps_old_entry() {
        let log_dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let path = write_log(
            log_dir.path(),
            "auth.log",
            "Failed password for root from 1.2.3.4\n",
        );
        let patterns = vec![r"Failed password .* from (\S+)".to_string()];

        let first = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &patterns,
            cache_root.path(),
            &NullResolver,
        )
        .unwrap();
        let cache_subdir = cache_root.path().join(first.cache_dirname());
        let first_entries: Vec<_> = std::fs::read_dir(&cache_subdir).unwrap().collect();
        assert_eq!(first_entries.len(), 1);

        std::fs::write(&path, "Failed password for root from 1.2.3.4\nextra\n").unwrap();

        let second = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &patterns,
            cache_root.path(),
            &NullResolver,
        )
        .unwrap();
        assert_eq!(second.parses_performed(), 1);
        let second_entries: Vec<_> = std::fs::read_dir(&cache_subdir).unwrap().collect();
        assert_eq!(second_entries.len(), 1, "stale entry should be swept");
    }

    #[test]
    fn pattern_set_change_yields_different_cache_dirname() {
        let log_dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        write_log(log_dir.path(), "auth.log", "irrelevant\n");

        let a = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &[r"foo(\S+)".to_string()],
            cache_root.path(),
            &NullResolver,
        )
        .unwrap();
        let b = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &[r"bar(\S+)".to_string()],
            cache_root.path(),
            &NullResolver,
        )
        .unwrap();
        assert_ne!(a.cache_dirname(), b.cache_dirname());
    }

    #[test]
    fn identical_content_under_different_names_shares_one_cache_record() {
        let log_dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        write_log(
            log_dir.path(),
            "auth.log.1",
            "Failed password for root from 1.2.3.4\n",
        );
        write_log(
            log_dir.path(),
            "auth.log.2",
            "Failed password for root from 1.2.3.4\n",
        );

        let lt = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &[r"Failed password .* from (\S+)".to_string()],
            cache_root.path(),
            &NullResolver,
        )
        .unwrap();

        assert_eq!(lt.parses_performed(), 1);
        assert_eq!(lt.offense_count(), 1);
        let cache_subdir = cache_root.path().join(lt.cache_dirname());
        let entries: Vec<_> = std::fs::read_dir(&cache_subdir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn pattern_without_capture_group_is_a_config_error() {
        let log_dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let err = LogType::construct(
            "ssh",
            log_dir.path(),
            "auth",
            &["no capture group here".to_string()],
            cache_root.path(),
            &NullResolver,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCaptureGroup { .. }));
    }
}

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use regex::Regex;
use tracing::{debug, warn};

use crate::aggregate::Aggregate;
use crate::country::CountryResolver;
use crate::error::{CacheError, LogIoError};

use super::format;

/// One concrete log file's parsed offenses, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    content_md5: [u8; 16],
    /// Current on-disk path. Re-resolved on every scan; not part of identity.
    log_path: PathBuf,
    offenses: BTreeMap<String, (u32, Option<String>)>,
}

impl CacheRecord {
    pub fn content_md5_hex(&self) -> String {
        format!("{:x}", md5::Digest(self.content_md5))
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn set_log_path(&mut self, path: PathBuf) {
        self.log_path = path;
    }

    /// Sum of offense counts across every address in this record.
    pub fn offense_count(&self) -> usize {
        self.offenses
            .values()
            .map(|(count, _)| *count as usize)
            .sum()
    }

    /// Fold this record's offenses into the running aggregate.
    pub fn map_into(&self, aggregate: &mut Aggregate) {
        for (addr, (count, country)) in &self.offenses {
            aggregate.add(addr, u64::from(*count), country.clone());
        }
    }

    /// Compute the MD5 of `path`'s raw bytes without parsing it.
    pub fn content_md5_of(path: &Path) -> Result<[u8; 16], LogIoError> {
        let mut file = File::open(path).map_err(|source| LogIoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut ctx = md5::Context::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|source| LogIoError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
        }
        Ok(ctx.compute().0)
    }

    /// Parse `log_path` fresh: stream it line by line (transparently
    /// gunzipping `.gz` names), match each configured pattern in order,
    /// and attribute the line to the first capture group of the first
    /// pattern that matches.
    pub fn build_from_log(
        log_path: &Path,
        patterns: &[Regex],
        country: &dyn CountryResolver,
    ) -> Result<Self, LogIoError> {
        let content_md5 = Self::content_md5_of(log_path)?;

        let file = File::open(log_path).map_err(|source| LogIoError::Open {
            path: log_path.to_path_buf(),
            source,
        })?;

        let is_gz = log_path
            .extension()
            .map(|ext| ext == "gz")
            .unwrap_or(false);

        let mut offenses: BTreeMap<String, (u32, Option<String>)> = BTreeMap::new();

        let read_line_err = |source: std::io::Error| LogIoError::Read {
            path: log_path.to_path_buf(),
            source,
        };

        if is_gz {
            let reader = BufReader::new(GzDecoder::new(file));
            Self::scan_lines(reader, patterns, country, &mut offenses, read_line_err)?;
        } else {
            let reader = BufReader::new(file);
            Self::scan_lines(reader, patterns, country, &mut offenses, read_line_err)?;
        }

        Ok(CacheRecord {
            content_md5,
            log_path: log_path.to_path_buf(),
            offenses,
        })
    }

    fn scan_lines<R: BufRead>(
        reader: R,
        patterns: &[Regex],
        country: &dyn CountryResolver,
        offenses: &mut BTreeMap<String, (u32, Option<String>)>,
        wrap_err: impl Fn(std::io::Error) -> LogIoError,
    ) -> Result<(), LogIoError> {
        for line in reader.lines() {
            let line = line.map_err(&wrap_err)?;
            let Some(addr) = first_capture(patterns, &line) else {
                continue;
            };
            if addr.is_empty() {
                continue;
            }
            let entry = offenses
                .entry(addr.to_string())
                .or_insert_with(|| (0, None));
            entry.0 += 1;
            if entry.1.is_none() {
                entry.1 = country.lookup(addr);
            } else if let Some(new_code) = country.lookup(addr) {
                if entry.1.as_deref() != Some(new_code.as_str()) {
                    debug!(address = addr, existing = ?entry.1, new = new_code, "country code diverges between records");
                }
            }
        }
        Ok(())
    }

    /// Write this record to `path` atomically (temp sibling + rename).
    pub fn write_cache(&self, path: &Path) -> Result<(), CacheError> {
        let dir = path.parent().expect("cache path always has a parent");
        let bytes = format::encode(&self.content_md5, &self.offenses);

        let tmp_path = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("cache")
        ));
        let io_err = |source: std::io::Error| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };

        {
            let mut f = File::create(&tmp_path).map_err(io_err)?;
            format::write_all(&mut f, &bytes).map_err(io_err)?;
            f.flush().map_err(io_err)?;
            f.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp_path, path).map_err(io_err)?;
        Ok(())
    }

    /// Load a previously-written cache file. A structurally invalid file
    /// is returned as an error; the caller treats that as "cache miss".
    pub fn load_from_cache(path: &Path) -> Result<Self, CacheError> {
        let bytes = std::fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CacheError::Malformed {
                    path: path.to_path_buf(),
                    reason: "file does not exist",
                }
            } else {
                CacheError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let (content_md5, offenses) = format::decode(path, &bytes)?;
        Ok(CacheRecord {
            content_md5,
            log_path: PathBuf::new(),
            offenses,
        })
    }
}

fn first_capture<'a>(patterns: &[Regex], line: &'a str) -> Option<&'a str> {
    for re in patterns {
        if let Some(caps) = re.captures(line) {
            if let Some(m) = caps.get(1) {
                return Some(m.as_str());
            }
            warn!(pattern = re.as_str(), "matched with no capture group 1");
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::country::NullResolver;

    fn pats(strs: &[&str]) -> Vec<Regex> {
        strs.iter().map(|s| Regex::new(s).unwrap()).collect()
    }

    #[test]
    fn counts_offenses_and_first_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        std::fs::write(
            &path,
            "Jan 1 Failed password for root from 1.2.3.4 port 1\n\
             Jan 1 Failed password for root from 1.2.3.4 port 2\n\
             Jan 1 Invalid user bob from 5.6.7.8 port 3\n",
        )
        .unwrap();

        let patterns = pats(&[
            r"Failed password .* from (\S+)",
            r"Invalid user \S+ from (\S+)",
        ]);

        let rec = CacheRecord::build_from_log(&path, &patterns, &NullResolver).unwrap();
        assert_eq!(rec.offense_count(), 3);
        let mut agg = Aggregate::new();
        rec.map_into(&mut agg);
        assert_eq!(agg.get("1.2.3.4").unwrap().count, 2);
        assert_eq!(agg.get("5.6.7.8").unwrap().count, 1);
    }

    #[test]
    fn gzip_logs_are_transparently_decoded() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log.gz");
        let raw = "Jan 1 Failed password for root from 9.9.9.9 port 1\n";
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(raw.as_bytes()).unwrap();
        let gz_bytes = enc.finish().unwrap();
        std::fs::write(&path, &gz_bytes).unwrap();

        let patterns = pats(&[r"Failed password .* from (\S+)"]);
        let rec = CacheRecord::build_from_log(&path, &patterns, &NullResolver).unwrap();
        assert_eq!(rec.offense_count(), 1);
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("auth.log");
        std::fs::write(&log_path, "Failed password for root from 1.1.1.1\n").unwrap();
        let patterns = pats(&[r"Failed password .* from (\S+)"]);
        let rec = CacheRecord::build_from_log(&log_path, &patterns, &NullResolver).unwrap();

        let cache_path = dir.path().join("cachefile");
        rec.write_cache(&cache_path).unwrap();
        assert!(cache_path.exists());
        // no stray temp file left behind
        assert!(std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .all(|e| !e.file_name().to_string_lossy().ends_with(".tmp")));

        let loaded = CacheRecord::load_from_cache(&cache_path).unwrap();
        assert_eq!(loaded.offense_count(), rec.offense_count());
        assert_eq!(loaded.content_md5, rec.content_md5);
    }

    #[test]
    fn malformed_cache_file_is_reported_not_panicked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, b"not a cache file").unwrap();
        let err = CacheRecord::load_from_cache(&path).unwrap_err();
        assert!(matches!(err, CacheError::BadMagic { .. }));
    }
}

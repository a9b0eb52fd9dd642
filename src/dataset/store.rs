//! Single-Source Windowed Store
//!
//! Read-only memory mapping of one canonical (or normalized) record file,
//! addressed as a fixed-stride arena by bounds-checked record index. Records
//! are decoded by copy; no pointer into the mapping leaves this module.
//!
//! A sample anchored at index `i` has:
//! - a past window `[i - P + 1 ..= i]` (ends at the anchor)
//! - a future window `[i + 1 ..= i + F]` (starts right after the anchor)
//!
//! Windows are truncated at the file ends rather than rejected.

use crate::dataset::record::Record;
use crate::dataset::sanitize::parse_norm_window;
use memmap2::Mmap;
use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Relative slack when matching a key against a one-record file.
pub(crate) const SINGLE_KEY_EPS: f64 = 1e-9;

#[derive(Debug)]
pub enum StoreError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    EmptyFile(PathBuf),
    Misaligned {
        path: PathBuf,
        size: u64,
        record_size: usize,
    },
    ZeroPastWindow(PathBuf),
    IndexOutOfRange {
        index: usize,
        len: usize,
    },
    KeyOutOfRange {
        key: f64,
        leftmost: f64,
        rightmost: f64,
    },
    InvalidRange {
        left: f64,
        right: f64,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            Self::EmptyFile(path) => write!(f, "{}: file is empty", path.display()),
            Self::Misaligned {
                path,
                size,
                record_size,
            } => write!(
                f,
                "{}: size {} is not a multiple of record size {}",
                path.display(),
                size,
                record_size
            ),
            Self::ZeroPastWindow(path) => {
                write!(f, "{}: past window length must be >= 1", path.display())
            }
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {} out of range for {} records", index, len)
            }
            Self::KeyOutOfRange {
                key,
                leftmost,
                rightmost,
            } => write!(f, "key {} outside [{}, {}]", key, leftmost, rightmost),
            Self::InvalidRange { left, right } => {
                write!(f, "invalid key range: left {} > right {}", left, right)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Consecutive records of one window, stacked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordWindow {
    /// Row-major `[len, feature_dim]`
    pub features: Vec<f64>,
    pub valid: Vec<bool>,
    pub keys: Vec<f64>,
}

impl RecordWindow {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowedSample {
    pub anchor_index: usize,
    pub anchor_key: f64,
    pub feature_dim: usize,
    pub past: RecordWindow,
    pub future: RecordWindow,
}

pub struct WindowedStore<R: Record> {
    path: PathBuf,
    mmap: Mmap,
    len: usize,
    past_len: usize,
    future_len: usize,
    leftmost: f64,
    rightmost: f64,
    step: f64,
    norm_window: Option<usize>,
    _record: PhantomData<R>,
}

impl<R: Record> std::fmt::Debug for WindowedStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedStore")
            .field("path", &self.path)
            .field("kind", &R::KIND)
            .field("len", &self.len)
            .field("past_len", &self.past_len)
            .field("future_len", &self.future_len)
            .field("leftmost", &self.leftmost)
            .field("rightmost", &self.rightmost)
            .field("step", &self.step)
            .finish()
    }
}

impl<R: Record> WindowedStore<R> {
    pub fn open(path: &Path, past_len: usize, future_len: usize) -> Result<Self, StoreError> {
        if past_len == 0 {
            return Err(StoreError::ZeroPastWindow(path.to_path_buf()));
        }
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();
        if size == 0 {
            return Err(StoreError::EmptyFile(path.to_path_buf()));
        }
        if size % R::SIZE as u64 != 0 {
            return Err(StoreError::Misaligned {
                path: path.to_path_buf(),
                size,
                record_size: R::SIZE,
            });
        }
        // SAFETY: the file is opened read-only and the pipeline never writes a
        // file while a store maps it.
        let mmap = unsafe { Mmap::map(&file) }.map_err(io_err)?;
        let len = mmap.len() / R::SIZE;

        let mut store = Self {
            path: path.to_path_buf(),
            mmap,
            len,
            past_len,
            future_len,
            leftmost: 0.0,
            rightmost: 0.0,
            step: 0.0,
            norm_window: parse_norm_window(path),
            _record: PhantomData,
        };
        store.leftmost = store.decode(0).key_value();
        store.rightmost = store.decode(len - 1).key_value();
        // mean spacing over the whole file; single deltas may carry jitter
        if len > 1 {
            store.step = (store.rightmost - store.leftmost) / (len - 1) as f64;
        }
        Ok(store)
    }

    #[inline]
    fn decode(&self, index: usize) -> R {
        let at = index * R::SIZE;
        R::decode(&self.mmap[at..at + R::SIZE])
    }

    pub fn record(&self, index: usize) -> Result<R, StoreError> {
        if index >= self.len {
            return Err(StoreError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(self.decode(index))
    }

    pub fn key_at(&self, index: usize) -> Result<f64, StoreError> {
        self.record(index).map(|r| r.key_value())
    }

    pub fn iter(&self) -> impl Iterator<Item = R> + '_ {
        (0..self.len).map(move |i| self.decode(i))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: empty files are rejected at open.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn past_len(&self) -> usize {
        self.past_len
    }

    pub fn future_len(&self) -> usize {
        self.future_len
    }

    pub fn leftmost_key(&self) -> f64 {
        self.leftmost
    }

    pub fn rightmost_key(&self) -> f64 {
        self.rightmost
    }

    /// Grid step; 0.0 for a one-record file.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Normalization window parsed from a `.normW<window>.bin` name.
    pub fn norm_window(&self) -> Option<usize> {
        self.norm_window
    }

    pub fn feature_dim(&self) -> usize {
        R::feature_dim()
    }

    /// Nearest record index for `key`. Keys more than half a step outside
    /// `[leftmost, rightmost]` are out of range.
    pub fn index_of_key(&self, key: f64) -> Result<usize, StoreError> {
        let out_of_range = || StoreError::KeyOutOfRange {
            key,
            leftmost: self.leftmost,
            rightmost: self.rightmost,
        };
        if !key.is_finite() {
            return Err(out_of_range());
        }
        if self.len == 1 || self.step <= 0.0 {
            let slack = SINGLE_KEY_EPS * self.leftmost.abs().max(1.0);
            return if (key - self.leftmost).abs() <= slack {
                Ok(0)
            } else {
                Err(out_of_range())
            };
        }
        let pos = (key - self.leftmost) / self.step;
        if pos < -0.5 || pos > (self.len - 1) as f64 + 0.5 {
            return Err(out_of_range());
        }
        Ok((pos.round().max(0.0) as usize).min(self.len - 1))
    }

    fn window(&self, start: usize, end: usize) -> RecordWindow {
        let dim = R::feature_dim();
        let n = end.saturating_sub(start);
        let mut w = RecordWindow {
            features: Vec::with_capacity(n * dim),
            valid: Vec::with_capacity(n),
            keys: Vec::with_capacity(n),
        };
        for i in start..end {
            let r = self.decode(i);
            for f in 0..dim {
                w.features.push(r.feature(f));
            }
            w.valid.push(r.is_valid());
            w.keys.push(r.key_value());
        }
        w
    }

    /// Past window of `past_len` ending at `index`, future window of
    /// `future_len` starting after it. Both may be shorter at the file ends.
    pub fn get_window(
        &self,
        index: usize,
        past_len: usize,
        future_len: usize,
    ) -> Result<WindowedSample, StoreError> {
        if past_len == 0 {
            return Err(StoreError::ZeroPastWindow(self.path.clone()));
        }
        let anchor = self.record(index)?;
        let past_start = (index + 1).saturating_sub(past_len);
        let future_end = index.saturating_add(1).saturating_add(future_len).min(self.len);
        Ok(WindowedSample {
            anchor_index: index,
            anchor_key: anchor.key_value(),
            feature_dim: R::feature_dim(),
            past: self.window(past_start, index + 1),
            future: self.window(index + 1, future_end),
        })
    }

    /// Sample at `index` using the configured window lengths.
    pub fn get(&self, index: usize) -> Result<WindowedSample, StoreError> {
        self.get_window(index, self.past_len, self.future_len)
    }

    pub fn get_by_key_value(&self, key: f64) -> Result<WindowedSample, StoreError> {
        self.get(self.index_of_key(key)?)
    }

    /// Samples for every record with key in `[left, right]` (inclusive).
    pub fn range_samples_by_keys(
        &self,
        left: f64,
        right: f64,
    ) -> Result<Vec<WindowedSample>, StoreError> {
        if left > right {
            return Err(StoreError::InvalidRange { left, right });
        }
        let lo = self.index_of_key(left)?;
        let hi = self.index_of_key(right)?;
        (lo..=hi).map(|i| self.get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::record::Scalar;
    use crate::dataset::sanitize::write_records;
    use tempfile::tempdir;

    fn grid(n: usize, step: f64) -> Vec<Scalar> {
        (0..n)
            .map(|i| Scalar {
                key: 100.0 + i as f64 * step,
                value: i as f64,
                valid: i % 3 != 2,
            })
            .collect()
    }

    fn open_grid(n: usize, p: usize, f: usize) -> (tempfile::TempDir, WindowedStore<Scalar>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.bin");
        write_records(&path, &grid(n, 2.0)).unwrap();
        let store = WindowedStore::<Scalar>::open(&path, p, f).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_exposes_grid() {
        let (_dir, store) = open_grid(10, 3, 2);
        assert_eq!(store.len(), 10);
        assert_eq!(store.leftmost_key(), 100.0);
        assert_eq!(store.rightmost_key(), 118.0);
        assert_eq!(store.step(), 2.0);
        assert_eq!(store.norm_window(), None);
    }

    #[test]
    fn test_windows_around_anchor() {
        let (_dir, store) = open_grid(10, 3, 2);
        let s = store.get(5).unwrap();
        assert_eq!(s.past.keys, vec![106.0, 108.0, 110.0]);
        assert_eq!(s.future.keys, vec![112.0, 114.0]);
        assert_eq!(s.past.features, vec![3.0, 4.0, 5.0]);
        assert_eq!(s.past.valid, vec![true, true, false]);
        assert_eq!(*s.past.keys.last().unwrap(), s.anchor_key);
    }

    #[test]
    fn test_windows_truncate_at_file_ends() {
        let (_dir, store) = open_grid(4, 3, 2);
        let s = store.get(0).unwrap();
        assert_eq!(s.past.len(), 1);
        let s = store.get(3).unwrap();
        assert!(s.future.is_empty());
        assert!(matches!(
            store.get(4),
            Err(StoreError::IndexOutOfRange { index: 4, len: 4 })
        ));
    }

    #[test]
    fn test_key_lookup_and_range() {
        let (_dir, store) = open_grid(10, 3, 1);
        assert_eq!(store.index_of_key(104.0).unwrap(), 2);
        assert_eq!(store.index_of_key(104.9).unwrap(), 2);
        assert_eq!(store.index_of_key(99.2).unwrap(), 0);
        assert!(store.index_of_key(98.0).is_err());
        assert!(store.index_of_key(119.5).is_err());

        let by_key = store.get_by_key_value(110.0).unwrap();
        assert_eq!(by_key.anchor_index, 5);

        let range = store.range_samples_by_keys(104.0, 108.0).unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[2].anchor_key, 108.0);
        assert!(matches!(
            store.range_samples_by_keys(108.0, 104.0),
            Err(StoreError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_step_uses_full_key_span() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jitter.bin");
        let mut records = grid(2000, 1.0);
        records[1].key += 0.0004;
        write_records(&path, &records).unwrap();

        let store = WindowedStore::<Scalar>::open(&path, 1, 0).unwrap();
        assert!((store.step() - 1.0).abs() < 1e-12);
        assert_eq!(store.index_of_key(2099.0).unwrap(), 1999);
        assert_eq!(store.index_of_key(101.0004).unwrap(), 1);
        assert_eq!(store.get(1999).unwrap().anchor_key, 2099.0);
    }

    #[test]
    fn test_open_rejects_bad_files() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            WindowedStore::<Scalar>::open(&empty, 1, 0),
            Err(StoreError::EmptyFile(_))
        ));

        let odd = dir.path().join("odd.bin");
        std::fs::write(&odd, vec![0u8; Scalar::SIZE * 2 + 1]).unwrap();
        assert!(matches!(
            WindowedStore::<Scalar>::open(&odd, 1, 0),
            Err(StoreError::Misaligned { .. })
        ));

        let good = dir.path().join("good.bin");
        write_records(&good, &grid(3, 1.0)).unwrap();
        assert!(matches!(
            WindowedStore::<Scalar>::open(&good, 0, 1),
            Err(StoreError::ZeroPastWindow(_))
        ));
        assert!(matches!(
            WindowedStore::<Scalar>::open(&dir.path().join("missing.bin"), 1, 0),
            Err(StoreError::Io { .. })
        ));
    }

    #[test]
    fn test_single_record_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("one.normW4.bin");
        write_records(&path, &grid(1, 1.0)).unwrap();
        let store = WindowedStore::<Scalar>::open(&path, 1, 0).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.step(), 0.0);
        assert_eq!(store.norm_window(), Some(4));
        assert_eq!(store.index_of_key(100.0).unwrap(), 0);
        assert!(store.index_of_key(101.0).is_err());
        let s = store.get(0).unwrap();
        assert_eq!(s.past.len(), 1);
        assert!(s.future.is_empty());
    }
}

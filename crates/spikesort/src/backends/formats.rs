//! Native file formats exchanged with external sorters.
//!
//! - NPY: 1-D numeric arrays (`spike_times.npy`, `spike_clusters.npy`)
//! - MDA: N-D column-major arrays (`raw.mda`, `firings.mda`)
//! - `cluster_KSLabel.tsv`: kilosort2 cluster labels
//! - `geom.csv`: channel locations

use spikesort_core::recording::Recording;
use spikesort_core::sorting::SortingResult;
use spikesort_core::types::UnitId;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid {kind} file: {message}")]
    Invalid { kind: &'static str, message: String },
    #[error("recording error: {0}")]
    Recording(#[from] spikesort_core::recording::RecordingError),
}

pub type Result<T> = std::result::Result<T, FormatError>;

fn invalid(kind: &'static str, message: impl Into<String>) -> FormatError {
    FormatError::Invalid {
        kind,
        message: message.into(),
    }
}

// --- NPY ---

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Read a little-endian numeric NPY array as integers.
///
/// Float arrays are rounded. Only the element count matters, so `(N,)` and
/// `(N, 1)` shapes read the same.
pub fn read_npy_i64(path: &Path) -> Result<Vec<i64>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(invalid("npy", "missing magic string"));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (usize::from(u16::from_le_bytes([bytes[8], bytes[9]])), 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(invalid("npy", "truncated header"));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(invalid("npy", format!("unsupported version {v}"))),
    };
    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .map(String::from_utf8_lossy)
        .ok_or_else(|| invalid("npy", "truncated header"))?;

    let descr = header_value(&header, "descr")
        .map(|v| v.trim_matches(|c| c == '\'' || c == '"').to_string())
        .ok_or_else(|| invalid("npy", "header has no descr"))?;
    // fortran_order is irrelevant for vectors; parse_shape rejects matrices
    let count = parse_shape(&header)?;

    let (width, decode): (usize, fn(&[u8]) -> i64) = match descr.as_str() {
        "<i8" => (8, |b| i64::from_le_bytes(b.try_into().unwrap_or([0; 8]))),
        "<u8" => (8, |b| u64::from_le_bytes(b.try_into().unwrap_or([0; 8])) as i64),
        "<i4" => (4, |b| i64::from(i32::from_le_bytes(b.try_into().unwrap_or([0; 4])))),
        "<u4" => (4, |b| i64::from(u32::from_le_bytes(b.try_into().unwrap_or([0; 4])))),
        "<i2" => (2, |b| i64::from(i16::from_le_bytes(b.try_into().unwrap_or([0; 2])))),
        "<u2" => (2, |b| i64::from(u16::from_le_bytes(b.try_into().unwrap_or([0; 2])))),
        "|i1" => (1, |b| i64::from(b[0] as i8)),
        "|u1" => (1, |b| i64::from(b[0])),
        "<f8" => (8, |b| f64::from_le_bytes(b.try_into().unwrap_or([0; 8])).round() as i64),
        "<f4" => (4, |b| f32::from_le_bytes(b.try_into().unwrap_or([0; 4])).round() as i64),
        other => return Err(invalid("npy", format!("unsupported dtype {other}"))),
    };

    let data = &bytes[data_start..];
    let len = count
        .checked_mul(width)
        .filter(|len| *len <= data.len())
        .ok_or_else(|| invalid("npy", format!("expected {count} elements, found {} bytes", data.len())))?;
    Ok(data[..len].chunks_exact(width).map(decode).collect())
}

/// Value text following `'key':` in an NPY header dict, up to the next comma
/// outside parentheses.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{key}':");
    let start = header.find(&pattern)? + pattern.len();
    let rest = header[start..].trim_start();
    let mut depth = 0i32;
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&rest[..=i]);
                }
            }
            ',' | '}' if depth == 0 => return Some(rest[..i].trim()),
            _ => {}
        }
    }
    Some(rest.trim())
}

fn parse_shape(header: &str) -> Result<usize> {
    let shape = header_value(header, "shape").ok_or_else(|| invalid("npy", "header has no shape"))?;
    let inner = shape.trim_start_matches('(').trim_end_matches(')');
    let dims = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| invalid("npy", format!("bad shape {shape}")))
        })
        .collect::<Result<Vec<_>>>()?;
    if dims.iter().filter(|d| **d > 1).count() > 1 {
        return Err(invalid("npy", format!("expected a vector, got shape {shape}")));
    }
    dims.iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
        .ok_or_else(|| invalid("npy", format!("shape {shape} is too large")))
}

/// Write a 1-D little-endian int64 NPY array (format version 1.0).
pub fn write_npy_i64(path: &Path, values: &[i64]) -> Result<()> {
    let dict = format!(
        "{{'descr': '<i8', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    // magic(6) + version(2) + len(2) + dict + '\n', padded to 64 bytes
    let unpadded = 10 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header = format!("{dict}{}\n", " ".repeat(padding));

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(NPY_MAGIC)?;
    out.write_all(&[1, 0])?;
    out.write_all(&(header.len() as u16).to_le_bytes())?;
    out.write_all(header.as_bytes())?;
    for v in values {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Kilosort output: one unit per cluster id, spikes from `spike_times.npy`.
pub fn read_kilosort_folder(folder: &Path) -> Result<SortingResult> {
    let times = read_npy_i64(&folder.join("spike_times.npy"))?;
    let clusters = read_npy_i64(&folder.join("spike_clusters.npy"))?;
    if times.len() != clusters.len() {
        return Err(invalid(
            "npy",
            format!(
                "spike_times has {} entries but spike_clusters has {}",
                times.len(),
                clusters.len()
            ),
        ));
    }
    let mut sorting = SortingResult::default();
    for (time, cluster) in times.into_iter().zip(clusters) {
        let frame = u64::try_from(time).map_err(|_| invalid("npy", format!("negative spike time {time}")))?;
        let unit = UnitId::try_from(cluster).map_err(|_| invalid("npy", format!("bad cluster id {cluster}")))?;
        sorting.push_spike(unit, frame);
    }
    sorting.finish();
    Ok(sorting)
}

/// `cluster_KSLabel.tsv`: cluster id to label (`good`, `mua`, ...).
pub fn read_ks_labels(path: &Path) -> Result<BTreeMap<UnitId, String>> {
    let content = std::fs::read_to_string(path)?;
    let mut labels = BTreeMap::new();
    for (n, line) in content.lines().enumerate() {
        if n == 0 || line.trim().is_empty() {
            continue;
        }
        let mut cols = line.split('\t');
        let (Some(id), Some(label)) = (cols.next(), cols.next()) else {
            return Err(invalid("tsv", format!("line {}: expected two columns", n + 1)));
        };
        let id = id
            .trim()
            .parse()
            .map_err(|_| invalid("tsv", format!("line {}: bad cluster id '{id}'", n + 1)))?;
        labels.insert(id, label.trim().to_string());
    }
    Ok(labels)
}

// --- MDA ---

const MDA_UINT8: i32 = -2;
const MDA_FLOAT32: i32 = -3;
const MDA_INT16: i32 = -4;
const MDA_INT32: i32 = -5;
const MDA_UINT16: i32 = -6;
const MDA_FLOAT64: i32 = -7;
const MDA_UINT32: i32 = -8;

/// Column-major N-D array read from an MDA file.
#[derive(Debug, Clone, PartialEq)]
pub struct Mda {
    pub dims: Vec<usize>,
    pub data: Vec<f64>,
}

impl Mda {
    /// Element at (row, col) of a 2-D array.
    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row + col * self.dims[0]]
    }
}

fn read_i32(reader: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_mda(path: &Path) -> Result<Mda> {
    let mut reader = BufReader::new(File::open(path)?);
    let code = read_i32(&mut reader)?;
    let _bytes_per_entry = read_i32(&mut reader)?;
    let ndims = read_i32(&mut reader)?;

    if ndims == 0 || ndims.unsigned_abs() > 50 {
        return Err(invalid("mda", format!("bad dimension count {ndims}")));
    }
    let mut dims = Vec::new();
    for _ in 0..ndims.unsigned_abs() {
        // negative count: 64-bit dimensions
        let dim = if ndims < 0 {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            i64::from_le_bytes(buf)
        } else {
            i64::from(read_i32(&mut reader)?)
        };
        let dim = usize::try_from(dim).map_err(|_| invalid("mda", format!("negative dimension {dim}")))?;
        dims.push(dim);
    }

    let width: usize = match code {
        MDA_UINT8 => 1,
        MDA_INT16 | MDA_UINT16 => 2,
        MDA_FLOAT32 | MDA_INT32 | MDA_UINT32 => 4,
        MDA_FLOAT64 => 8,
        other => return Err(invalid("mda", format!("unsupported data type code {other}"))),
    };
    let len = dims
        .iter()
        .try_fold(width, |acc, d| acc.checked_mul(*d))
        .ok_or_else(|| invalid("mda", format!("dimensions {dims:?} are too large")))?;
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    if raw.len() < len {
        return Err(invalid(
            "mda",
            format!("dimensions {dims:?} need {len} bytes, found {}", raw.len()),
        ));
    }
    raw.truncate(len);

    let data = raw
        .chunks_exact(width)
        .map(|b| match code {
            MDA_UINT8 => f64::from(b[0]),
            MDA_INT16 => f64::from(i16::from_le_bytes([b[0], b[1]])),
            MDA_UINT16 => f64::from(u16::from_le_bytes([b[0], b[1]])),
            MDA_FLOAT32 => f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            MDA_INT32 => f64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            MDA_UINT32 => f64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            _ => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        })
        .collect();
    Ok(Mda { dims, data })
}

fn write_header(out: &mut impl Write, code: i32, width: i32, dims: &[usize]) -> Result<()> {
    out.write_all(&code.to_le_bytes())?;
    out.write_all(&width.to_le_bytes())?;
    out.write_all(&(dims.len() as i32).to_le_bytes())?;
    for d in dims {
        let d = i32::try_from(*d).map_err(|_| invalid("mda", format!("dimension {d} too large")))?;
        out.write_all(&d.to_le_bytes())?;
    }
    Ok(())
}

pub fn write_mda_f64(path: &Path, dims: &[usize], data: &[f64]) -> Result<()> {
    if dims.iter().product::<usize>() != data.len() {
        return Err(invalid("mda", "data length does not match dimensions"));
    }
    let mut out = BufWriter::new(File::create(path)?);
    write_header(&mut out, MDA_FLOAT64, 8, dims)?;
    for v in data {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Stream a recording into a channels x frames float32 MDA file.
pub fn write_recording_mda(recording: &dyn Recording, path: &Path) -> Result<()> {
    const CHUNK: u64 = 65_536;
    let ids = recording.channel_ids();
    let frames = recording.num_frames();
    let mut out = BufWriter::new(File::create(path)?);
    write_header(&mut out, MDA_FLOAT32, 4, &[ids.len(), frames as usize])?;
    let mut start = 0;
    while start < frames {
        let end = (start + CHUNK).min(frames);
        let chunk = recording.traces(&ids, start, end)?;
        for t in 0..(end - start) as usize {
            for channel in &chunk {
                out.write_all(&channel[t].to_le_bytes())?;
            }
        }
        start = end;
    }
    out.flush()?;
    Ok(())
}

/// `firings.mda` rows: primary channel, spike time, unit label.
pub fn read_firings(path: &Path) -> Result<SortingResult> {
    let mda = read_mda(path)?;
    if mda.dims.len() != 2 || mda.dims[0] < 3 {
        return Err(invalid("mda", format!("firings must be 3 x L, got {:?}", mda.dims)));
    }
    let mut sorting = SortingResult::default();
    for col in 0..mda.dims[1] {
        let time = firings_entry(mda.at(1, col), col, u64::MAX)?;
        let label = firings_entry(mda.at(2, col), col, u64::from(UnitId::MAX))?;
        let label = UnitId::try_from(label).map_err(|_| invalid("mda", format!("bad label in column {col}")))?;
        sorting.push_spike(label, time);
    }
    sorting.finish();
    Ok(sorting)
}

/// A firings value as a non-negative integer no larger than `max`.
fn firings_entry(value: f64, col: usize, max: u64) -> Result<u64> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < 0.0 || rounded > max as f64 {
        return Err(invalid("mda", format!("entry {value} out of range in column {col}")));
    }
    Ok(rounded as u64)
}

pub fn write_firings(path: &Path, sorting: &SortingResult) -> Result<()> {
    let mut events: Vec<(u64, UnitId)> = sorting
        .units
        .iter()
        .flat_map(|(id, unit)| unit.spike_train.iter().map(move |t| (*t, *id)))
        .collect();
    events.sort_unstable();
    let mut data = Vec::with_capacity(events.len() * 3);
    for (time, id) in &events {
        data.extend_from_slice(&[0.0, *time as f64, f64::from(*id)]);
    }
    write_mda_f64(path, &[3, events.len()], &data)
}

/// One `x,y` row per channel.
pub fn write_geom_csv(path: &Path, locations: &[Vec<f64>]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for loc in locations {
        let row: Vec<String> = loc.iter().map(ToString::to_string).collect();
        writeln!(out, "{}", row.join(","))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikesort_core::recording::InMemoryRecording;
    use tempfile::TempDir;

    #[test]
    fn npy_round_trip_and_header_alignment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spike_times.npy");
        write_npy_i64(&path, &[10, 20, 35]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!((bytes.len() - 3 * 8) % 64, 0);
        assert_eq!(read_npy_i64(&path).unwrap(), vec![10, 20, 35]);
    }

    #[test]
    fn npy_reads_int32_column_vectors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clusters.npy");
        let dict = "{'descr': '<i4', 'fortran_order': False, 'shape': (2, 1), }";
        let mut header = dict.to_string();
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');
        let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(read_npy_i64(&path).unwrap(), vec![7, -1]);
    }

    #[test]
    fn npy_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.npy");
        std::fs::write(&path, b"not an npy file").unwrap();
        assert!(matches!(read_npy_i64(&path), Err(FormatError::Invalid { .. })));
    }

    #[test]
    fn kilosort_folder_groups_by_cluster() {
        let dir = TempDir::new().unwrap();
        write_npy_i64(&dir.path().join("spike_times.npy"), &[100, 50, 300, 200]).unwrap();
        write_npy_i64(&dir.path().join("spike_clusters.npy"), &[1, 1, 4, 1]).unwrap();
        let sorting = read_kilosort_folder(dir.path()).unwrap();
        assert_eq!(sorting.unit_ids(), vec![1, 4]);
        assert_eq!(sorting.spike_train(1), Some(&[50, 100, 200][..]));
    }

    #[test]
    fn kilosort_folder_length_mismatch_is_invalid() {
        let dir = TempDir::new().unwrap();
        write_npy_i64(&dir.path().join("spike_times.npy"), &[1, 2]).unwrap();
        write_npy_i64(&dir.path().join("spike_clusters.npy"), &[0]).unwrap();
        assert!(matches!(
            read_kilosort_folder(dir.path()),
            Err(FormatError::Invalid { .. })
        ));
    }

    #[test]
    fn ks_labels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster_KSLabel.tsv");
        std::fs::write(&path, "cluster_id\tKSLabel\n0\tgood\n3\tmua\n").unwrap();
        let labels = read_ks_labels(&path).unwrap();
        assert_eq!(labels[&0], "good");
        assert_eq!(labels[&3], "mua");
    }

    #[test]
    fn firings_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("firings.mda");
        let mut sorting = SortingResult::default();
        sorting.add_unit(1, vec![5, 40]);
        sorting.add_unit(2, vec![12]);
        write_firings(&path, &sorting).unwrap();
        assert_eq!(read_firings(&path).unwrap(), sorting);
    }

    fn write_raw(path: &Path, words: &[&[u8]]) {
        std::fs::write(path, words.concat()).unwrap();
    }

    #[test]
    fn mda_negative_dimension_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("firings.mda");
        write_raw(
            &path,
            &[
                &MDA_FLOAT64.to_le_bytes(),
                &8i32.to_le_bytes(),
                &2i32.to_le_bytes(),
                &3i32.to_le_bytes(),
                &(-1i32).to_le_bytes(),
            ],
        );
        assert!(matches!(read_firings(&path), Err(FormatError::Invalid { .. })));
    }

    #[test]
    fn mda_dimensions_larger_than_file_are_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("firings.mda");
        write_raw(
            &path,
            &[
                &MDA_FLOAT64.to_le_bytes(),
                &8i32.to_le_bytes(),
                &(-2i32).to_le_bytes(),
                &3i64.to_le_bytes(),
                &(i64::MAX / 2).to_le_bytes(),
                &1.0f64.to_le_bytes(),
            ],
        );
        assert!(matches!(read_mda(&path), Err(FormatError::Invalid { .. })));
    }

    #[test]
    fn npy_huge_shape_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spike_times.npy");
        let header = "{'descr': '<i8', 'fortran_order': False, 'shape': (4611686018427387904,), }\n";
        let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&1i64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(read_npy_i64(&path), Err(FormatError::Invalid { .. })));
    }

    #[test]
    fn firings_reject_non_finite_and_oversized_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("firings.mda");
        for bad in [[0.0, f64::NAN, 1.0], [0.0, 10.0, f64::INFINITY], [0.0, 10.0, 1e12], [0.0, -3.0, 1.0]] {
            write_mda_f64(&path, &[3, 1], &bad).unwrap();
            assert!(
                matches!(read_firings(&path), Err(FormatError::Invalid { .. })),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn recording_mda_is_channel_major_per_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw.mda");
        let rec = InMemoryRecording::new(1000.0, vec![vec![1.0, 2.0, 3.0], vec![-1.0, -2.0, -3.0]]).unwrap();
        write_recording_mda(&rec, &path).unwrap();

        let mda = read_mda(&path).unwrap();
        assert_eq!(mda.dims, vec![2, 3]);
        assert_eq!(mda.at(0, 2), 3.0);
        assert_eq!(mda.at(1, 1), -2.0);
    }

    #[test]
    fn geom_csv_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geom.csv");
        write_geom_csv(&path, &[vec![0.0, 0.0], vec![0.0, 25.0]]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0,0\n0,25\n");
    }
}

//! Columnar encoding and decoding.
//!
//! One Arrow column goes in, one [`CompressedColumn`] comes out: a
//! cost-selected compression scheme, a separate null bitmap, and min/max/
//! null-count statistics gathered in the same pass. Decoding reverses the
//! scheme and reapplies the bitmap, yielding exactly the original values.

use crate::bitmap::NullBitmap;
use crate::scheme::CompressionScheme;
use crate::stats::ColumnStats;
use crate::varint::{read_varint, varint_len, write_varint, zigzag_decode, zigzag_encode};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
};
use relcache_core::{CacheError, DataType, Result, ScalarValue};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Encoder tuning knobs, owned by the cache configuration.
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// Dictionary encoding is only considered below this cardinality.
    pub dictionary_max_cardinality: usize,
    /// A single value whose encoded form exceeds this many bytes forces
    /// the column back to plain encoding.
    pub value_size_guard: usize,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            dictionary_max_cardinality: 4096,
            value_size_guard: 1024 * 1024,
        }
    }
}

/// One encoded column of a columnar block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedColumn {
    pub data_type: DataType,
    pub scheme: CompressionScheme,
    pub nulls: NullBitmap,
    pub values: Vec<u8>,
    pub stats: ColumnStats,
}

impl CompressedColumn {
    pub fn row_count(&self) -> usize {
        self.nulls.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.values.len() + self.nulls.size_in_bytes()
    }
}

/// Valid (non-null) values of a column, in row order.
enum TypedValues {
    Boolean(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
}

impl TypedValues {
    fn len(&self) -> usize {
        match self {
            TypedValues::Boolean(v) => v.len(),
            TypedValues::Int32(v) => v.len(),
            TypedValues::Int64(v) => v.len(),
            TypedValues::Float64(v) => v.len(),
            TypedValues::Utf8(v) => v.len(),
        }
    }
}

/// Encode one column of a record batch.
pub fn encode_column(
    data_type: DataType,
    array: &ArrayRef,
    opts: &EncoderOptions,
) -> Result<CompressedColumn> {
    let (nulls, values, stats) = extract(data_type, array)?;
    let scheme = select_scheme(&values, opts);
    let (scheme, bytes) = match encode_values(&values, scheme, opts) {
        Ok(bytes) => (scheme, bytes),
        // Oversized value under a compact scheme: keep the batch, store raw.
        Err(CacheError::EncodingOverflow { .. }) => (
            CompressionScheme::Plain,
            encode_values(&values, CompressionScheme::Plain, opts)?,
        ),
        Err(e) => return Err(e),
    };
    Ok(CompressedColumn {
        data_type,
        scheme,
        nulls,
        values: bytes,
        stats,
    })
}

/// Decode a column back into an Arrow array of `column.row_count()` values.
pub fn decode_column(column: &CompressedColumn) -> Result<ArrayRef> {
    let values = decode_values(column)?;
    if values.len() != column.nulls.valid_count() {
        return Err(CacheError::Serialization(format!(
            "decoded {} values, bitmap expects {}",
            values.len(),
            column.nulls.valid_count()
        )));
    }
    let row_count = column.nulls.len();
    let nulls = &column.nulls;
    Ok(match values {
        TypedValues::Boolean(vals) => {
            Arc::new(BooleanArray::from(weave(nulls, row_count, vals))) as ArrayRef
        }
        TypedValues::Int32(vals) => {
            Arc::new(Int32Array::from(weave(nulls, row_count, vals))) as ArrayRef
        }
        TypedValues::Int64(vals) => {
            Arc::new(Int64Array::from(weave(nulls, row_count, vals))) as ArrayRef
        }
        TypedValues::Float64(vals) => {
            Arc::new(Float64Array::from(weave(nulls, row_count, vals))) as ArrayRef
        }
        TypedValues::Utf8(vals) => {
            Arc::new(StringArray::from_iter(weave(nulls, row_count, vals))) as ArrayRef
        }
    })
}

fn weave<T>(nulls: &NullBitmap, row_count: usize, values: Vec<T>) -> Vec<Option<T>> {
    let mut iter = values.into_iter();
    (0..row_count)
        .map(|i| if nulls.is_valid(i) { iter.next() } else { None })
        .collect()
}

// ---------------------------------------------------------------------------
// Extraction

fn extract(
    data_type: DataType,
    array: &ArrayRef,
) -> Result<(NullBitmap, TypedValues, ColumnStats)> {
    let mut nulls = NullBitmap::with_capacity(array.len());
    let mut stats = ColumnStats::new();
    let values = match data_type {
        DataType::Boolean => {
            let arr = downcast::<BooleanArray>(array, data_type)?;
            let mut out = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                if arr.is_null(i) {
                    nulls.push(false);
                    stats.observe_null();
                } else {
                    nulls.push(true);
                    let v = arr.value(i);
                    stats.observe(&ScalarValue::Boolean(Some(v)));
                    out.push(v);
                }
            }
            TypedValues::Boolean(out)
        }
        DataType::Int32 => {
            let arr = downcast::<Int32Array>(array, data_type)?;
            let mut out = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                if arr.is_null(i) {
                    nulls.push(false);
                    stats.observe_null();
                } else {
                    nulls.push(true);
                    let v = arr.value(i);
                    stats.observe(&ScalarValue::Int32(Some(v)));
                    out.push(v);
                }
            }
            TypedValues::Int32(out)
        }
        DataType::Int64 => {
            let arr = downcast::<Int64Array>(array, data_type)?;
            let mut out = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                if arr.is_null(i) {
                    nulls.push(false);
                    stats.observe_null();
                } else {
                    nulls.push(true);
                    let v = arr.value(i);
                    stats.observe(&ScalarValue::Int64(Some(v)));
                    out.push(v);
                }
            }
            TypedValues::Int64(out)
        }
        DataType::Float64 => {
            let arr = downcast::<Float64Array>(array, data_type)?;
            let mut out = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                if arr.is_null(i) {
                    nulls.push(false);
                    stats.observe_null();
                } else {
                    nulls.push(true);
                    let v = arr.value(i);
                    stats.observe(&ScalarValue::Float64(Some(v)));
                    out.push(v);
                }
            }
            TypedValues::Float64(out)
        }
        DataType::Utf8 => {
            let arr = downcast::<StringArray>(array, data_type)?;
            let mut out = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                if arr.is_null(i) {
                    nulls.push(false);
                    stats.observe_null();
                } else {
                    nulls.push(true);
                    let v = arr.value(i).to_string();
                    stats.observe(&ScalarValue::Utf8(Some(v.clone())));
                    out.push(v);
                }
            }
            TypedValues::Utf8(out)
        }
    };
    Ok((nulls, values, stats))
}

fn downcast<T: 'static>(array: &ArrayRef, data_type: DataType) -> Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CacheError::TypeMismatch {
            expected: data_type.to_string(),
            found: array.data_type().to_string(),
        })
}

// ---------------------------------------------------------------------------
// Scheme selection

fn select_scheme(values: &TypedValues, opts: &EncoderOptions) -> CompressionScheme {
    if values.len() == 0 {
        return CompressionScheme::Plain;
    }
    let mut candidates: Vec<(CompressionScheme, usize)> = Vec::with_capacity(4);
    match values {
        TypedValues::Boolean(vals) => {
            candidates.push((CompressionScheme::Plain, vals.len()));
            candidates.push((CompressionScheme::BitPacked, vals.len().div_ceil(8)));
            candidates.push((CompressionScheme::RunLength, rle_size(vals, 1)));
        }
        TypedValues::Int32(vals) => {
            candidates.push((CompressionScheme::Plain, 4 * vals.len()));
            candidates.push((CompressionScheme::RunLength, rle_size(vals, 4)));
            candidates.push((
                CompressionScheme::Delta,
                delta_size(vals.iter().map(|&v| v as i64)),
            ));
            if let Some(distinct) = bounded_distinct(vals.iter(), opts.dictionary_max_cardinality) {
                candidates.push((CompressionScheme::Dictionary, 4 + 4 * distinct + 4 * vals.len()));
            }
        }
        TypedValues::Int64(vals) => {
            candidates.push((CompressionScheme::Plain, 8 * vals.len()));
            candidates.push((CompressionScheme::RunLength, rle_size(vals, 8)));
            candidates.push((CompressionScheme::Delta, delta_size(vals.iter().copied())));
            if let Some(distinct) = bounded_distinct(vals.iter(), opts.dictionary_max_cardinality) {
                candidates.push((CompressionScheme::Dictionary, 4 + 8 * distinct + 4 * vals.len()));
            }
        }
        TypedValues::Float64(vals) => {
            candidates.push((CompressionScheme::Plain, 8 * vals.len()));
            candidates.push((
                CompressionScheme::RunLength,
                rle_size(&vals.iter().map(|v| v.to_bits()).collect::<Vec<_>>(), 8),
            ));
            if let Some(distinct) = bounded_distinct(
                vals.iter().map(|v| v.to_bits()),
                opts.dictionary_max_cardinality,
            ) {
                candidates.push((CompressionScheme::Dictionary, 4 + 8 * distinct + 4 * vals.len()));
            }
        }
        TypedValues::Utf8(vals) => {
            candidates.push((
                CompressionScheme::Plain,
                vals.iter().map(|s| 4 + s.len()).sum(),
            ));
            candidates.push((CompressionScheme::RunLength, str_rle_size(vals)));
            if let Some(dict_bytes) =
                str_dict_size(vals, opts.dictionary_max_cardinality)
            {
                candidates.push((CompressionScheme::Dictionary, dict_bytes + 4 * vals.len()));
            }
        }
    }
    candidates
        .into_iter()
        .min_by(|(sa, a), (sb, b)| a.cmp(b).then(sa.decode_rank().cmp(&sb.decode_rank())))
        .map(|(scheme, _)| scheme)
        .unwrap_or(CompressionScheme::Plain)
}

fn rle_size<T: PartialEq>(vals: &[T], width: usize) -> usize {
    let mut size = 0;
    let mut run_len = 0u64;
    let mut prev: Option<&T> = None;
    for v in vals {
        match prev {
            Some(p) if p == v => run_len += 1,
            _ => {
                if run_len > 0 {
                    size += width + varint_len(run_len);
                }
                prev = Some(v);
                run_len = 1;
            }
        }
    }
    if run_len > 0 {
        size += width + varint_len(run_len);
    }
    size
}

fn str_rle_size(vals: &[String]) -> usize {
    let mut size = 0;
    let mut run_len = 0u64;
    let mut prev: Option<&String> = None;
    for v in vals {
        match prev {
            Some(p) if p == v => run_len += 1,
            _ => {
                if let Some(p) = prev {
                    size += 4 + p.len() + varint_len(run_len);
                }
                prev = Some(v);
                run_len = 1;
            }
        }
    }
    if let Some(p) = prev {
        size += 4 + p.len() + varint_len(run_len);
    }
    size
}

fn delta_size(mut vals: impl Iterator<Item = i64>) -> usize {
    let first = match vals.next() {
        Some(v) => v,
        None => return 0,
    };
    let mut size = 8;
    let mut prev = first;
    for v in vals {
        size += varint_len(zigzag_encode(v.wrapping_sub(prev)));
        prev = v;
    }
    size
}

fn bounded_distinct<T: std::hash::Hash + Eq>(
    vals: impl Iterator<Item = T>,
    cap: usize,
) -> Option<usize> {
    let mut seen = HashSet::new();
    for v in vals {
        seen.insert(v);
        if seen.len() > cap {
            return None;
        }
    }
    Some(seen.len())
}

fn str_dict_size(vals: &[String], cap: usize) -> Option<usize> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut bytes = 4usize;
    for v in vals {
        if seen.insert(v) {
            bytes += 4 + v.len();
            if seen.len() > cap {
                return None;
            }
        }
    }
    Some(bytes)
}

// ---------------------------------------------------------------------------
// Encoding

fn encode_values(
    values: &TypedValues,
    scheme: CompressionScheme,
    opts: &EncoderOptions,
) -> Result<Vec<u8>> {
    use CompressionScheme::*;
    match (values, scheme) {
        (TypedValues::Boolean(vals), Plain) => Ok(vals.iter().map(|&b| b as u8).collect()),
        (TypedValues::Boolean(vals), BitPacked) => {
            let mut out = vec![0u8; vals.len().div_ceil(8)];
            for (i, &v) in vals.iter().enumerate() {
                if v {
                    out[i / 8] |= 1 << (i % 8);
                }
            }
            Ok(out)
        }
        (TypedValues::Boolean(vals), RunLength) => {
            encode_rle(vals, |v, out| {
                out.push(*v as u8);
                Ok(())
            })
        }

        (TypedValues::Int32(vals), Plain) => {
            let mut out = Vec::with_capacity(4 * vals.len());
            for v in vals {
                out.extend_from_slice(&v.to_le_bytes());
            }
            Ok(out)
        }
        (TypedValues::Int32(vals), RunLength) => encode_rle(vals, |v, out| {
            out.extend_from_slice(&v.to_le_bytes());
            Ok(())
        }),
        (TypedValues::Int32(vals), Delta) => Ok(encode_delta(vals.iter().map(|&v| v as i64))),
        (TypedValues::Int32(vals), Dictionary) => {
            encode_dict(vals, |v| *v, |v, out| {
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            })
        }

        (TypedValues::Int64(vals), Plain) => {
            let mut out = Vec::with_capacity(8 * vals.len());
            for v in vals {
                out.extend_from_slice(&v.to_le_bytes());
            }
            Ok(out)
        }
        (TypedValues::Int64(vals), RunLength) => encode_rle(vals, |v, out| {
            out.extend_from_slice(&v.to_le_bytes());
            Ok(())
        }),
        (TypedValues::Int64(vals), Delta) => Ok(encode_delta(vals.iter().copied())),
        (TypedValues::Int64(vals), Dictionary) => {
            encode_dict(vals, |v| *v, |v, out| {
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            })
        }

        (TypedValues::Float64(vals), Plain) => {
            let mut out = Vec::with_capacity(8 * vals.len());
            for v in vals {
                out.extend_from_slice(&v.to_le_bytes());
            }
            Ok(out)
        }
        (TypedValues::Float64(vals), RunLength) => {
            // Runs compare bit patterns, so NaN repeats still collapse.
            let bits: Vec<u64> = vals.iter().map(|v| v.to_bits()).collect();
            encode_rle(&bits, |v, out| {
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            })
        }
        (TypedValues::Float64(vals), Dictionary) => {
            let bits: Vec<u64> = vals.iter().map(|v| v.to_bits()).collect();
            encode_dict(&bits, |v| *v, |v, out| {
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            })
        }

        (TypedValues::Utf8(vals), Plain) => {
            let mut out = Vec::new();
            for v in vals {
                write_str(v, &mut out);
            }
            Ok(out)
        }
        (TypedValues::Utf8(vals), RunLength) => {
            let guard = opts.value_size_guard;
            encode_rle(vals, move |v, out| {
                write_str_guarded(v, guard, out)
            })
        }
        (TypedValues::Utf8(vals), Dictionary) => {
            let guard = opts.value_size_guard;
            encode_dict(
                vals,
                |v| v.clone(),
                move |v, out| write_str_guarded(v, guard, out),
            )
        }

        (_, scheme) => Err(CacheError::Serialization(format!(
            "scheme {} not applicable to column type",
            scheme
        ))),
    }
}

fn encode_rle<T, F>(vals: &[T], mut write_value: F) -> Result<Vec<u8>>
where
    T: PartialEq,
    F: FnMut(&T, &mut Vec<u8>) -> Result<()>,
{
    let mut out = Vec::new();
    let mut iter = vals.iter();
    let mut current = match iter.next() {
        Some(v) => v,
        None => return Ok(out),
    };
    let mut run_len = 1u64;
    for v in iter {
        if v == current {
            run_len += 1;
        } else {
            write_value(current, &mut out)?;
            write_varint(run_len, &mut out);
            current = v;
            run_len = 1;
        }
    }
    write_value(current, &mut out)?;
    write_varint(run_len, &mut out);
    Ok(out)
}

fn encode_delta(mut vals: impl Iterator<Item = i64>) -> Vec<u8> {
    let mut out = Vec::new();
    let first = match vals.next() {
        Some(v) => v,
        None => return out,
    };
    out.extend_from_slice(&first.to_le_bytes());
    let mut prev = first;
    for v in vals {
        write_varint(zigzag_encode(v.wrapping_sub(prev)), &mut out);
        prev = v;
    }
    out
}

fn encode_dict<T, K, F>(vals: &[T], key: impl Fn(&T) -> K, mut write_value: F) -> Result<Vec<u8>>
where
    K: std::hash::Hash + Eq,
    F: FnMut(&T, &mut Vec<u8>) -> Result<()>,
{
    let mut codes = Vec::with_capacity(vals.len());
    let mut index: std::collections::HashMap<K, u32> = std::collections::HashMap::new();
    let mut entries: Vec<&T> = Vec::new();
    for v in vals {
        let code = match index.entry(key(v)) {
            std::collections::hash_map::Entry::Occupied(e) => *e.get(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let code = entries.len() as u32;
                entries.push(v);
                e.insert(code);
                code
            }
        };
        codes.push(code);
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        write_value(entry, &mut out)?;
    }
    for code in codes {
        out.extend_from_slice(&code.to_le_bytes());
    }
    Ok(out)
}

fn write_str(value: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn write_str_guarded(value: &str, guard: usize, out: &mut Vec<u8>) -> Result<()> {
    if value.len() > guard {
        return Err(CacheError::EncodingOverflow {
            bytes: value.len(),
            limit: guard,
        });
    }
    write_str(value, out);
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding

fn decode_values(column: &CompressedColumn) -> Result<TypedValues> {
    let valid = column.nulls.valid_count();
    let bytes = &column.values;
    let scheme = column.scheme;
    match column.data_type {
        DataType::Boolean => Ok(TypedValues::Boolean(decode_bools(bytes, scheme, valid)?)),
        DataType::Int32 => {
            let wide = decode_ints(bytes, scheme, valid, 4)?;
            Ok(TypedValues::Int32(
                wide.into_iter().map(|v| v as i32).collect(),
            ))
        }
        DataType::Int64 => Ok(TypedValues::Int64(decode_ints(bytes, scheme, valid, 8)?)),
        DataType::Float64 => Ok(TypedValues::Float64(decode_floats(bytes, scheme, valid)?)),
        DataType::Utf8 => Ok(TypedValues::Utf8(decode_strings(bytes, scheme, valid)?)),
    }
}

fn unsupported(scheme: CompressionScheme, data_type: DataType) -> CacheError {
    CacheError::Serialization(format!("scheme {} not valid for {}", scheme, data_type))
}

fn decode_bools(bytes: &[u8], scheme: CompressionScheme, valid: usize) -> Result<Vec<bool>> {
    match scheme {
        CompressionScheme::Plain => {
            check_len(bytes, valid)?;
            Ok(bytes[..valid].iter().map(|&b| b != 0).collect())
        }
        CompressionScheme::BitPacked => {
            check_len(bytes, valid.div_ceil(8))?;
            Ok((0..valid)
                .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
                .collect())
        }
        CompressionScheme::RunLength => {
            let mut out = Vec::with_capacity(valid);
            let mut pos = 0;
            while out.len() < valid {
                let value = *bytes
                    .get(pos)
                    .ok_or_else(|| CacheError::Serialization("rle truncated".to_string()))?
                    != 0;
                pos += 1;
                let run = read_varint(bytes, &mut pos)? as usize;
                out.extend(std::iter::repeat(value).take(run));
            }
            expect_exact(out.len(), valid)?;
            Ok(out)
        }
        other => Err(unsupported(other, DataType::Boolean)),
    }
}

fn decode_ints(
    bytes: &[u8],
    scheme: CompressionScheme,
    valid: usize,
    width: usize,
) -> Result<Vec<i64>> {
    let read_fixed = |pos: &mut usize| -> Result<i64> {
        let end = *pos + width;
        let slice = bytes
            .get(*pos..end)
            .ok_or_else(|| CacheError::Serialization("int column truncated".to_string()))?;
        *pos = end;
        Ok(if width == 4 {
            i32::from_le_bytes(slice.try_into().expect("4-byte slice")) as i64
        } else {
            i64::from_le_bytes(slice.try_into().expect("8-byte slice"))
        })
    };
    match scheme {
        CompressionScheme::Plain => {
            let mut pos = 0;
            let mut out = Vec::with_capacity(valid);
            for _ in 0..valid {
                out.push(read_fixed(&mut pos)?);
            }
            Ok(out)
        }
        CompressionScheme::RunLength => {
            let mut out = Vec::with_capacity(valid);
            let mut pos = 0;
            while out.len() < valid {
                let value = read_fixed(&mut pos)?;
                let run = read_varint(bytes, &mut pos)? as usize;
                out.extend(std::iter::repeat(value).take(run));
            }
            expect_exact(out.len(), valid)?;
            Ok(out)
        }
        CompressionScheme::Delta => {
            if valid == 0 {
                return Ok(vec![]);
            }
            let mut pos = 0;
            let first_bytes = bytes
                .get(0..8)
                .ok_or_else(|| CacheError::Serialization("delta column truncated".to_string()))?;
            let mut current = i64::from_le_bytes(first_bytes.try_into().expect("8-byte slice"));
            pos += 8;
            let mut out = Vec::with_capacity(valid);
            out.push(current);
            for _ in 1..valid {
                let delta = zigzag_decode(read_varint(bytes, &mut pos)?);
                current = current.wrapping_add(delta);
                out.push(current);
            }
            Ok(out)
        }
        CompressionScheme::Dictionary => {
            let mut pos = 0;
            let count = read_u32(bytes, &mut pos)? as usize;
            let mut dict = Vec::with_capacity(count);
            for _ in 0..count {
                dict.push(read_fixed(&mut pos)?);
            }
            read_dict_codes(bytes, &mut pos, valid, &dict)
        }
        other => Err(unsupported(
            other,
            if width == 4 {
                DataType::Int32
            } else {
                DataType::Int64
            },
        )),
    }
}

fn decode_floats(bytes: &[u8], scheme: CompressionScheme, valid: usize) -> Result<Vec<f64>> {
    let read_fixed = |pos: &mut usize| -> Result<f64> {
        let end = *pos + 8;
        let slice = bytes
            .get(*pos..end)
            .ok_or_else(|| CacheError::Serialization("float column truncated".to_string()))?;
        *pos = end;
        Ok(f64::from_le_bytes(slice.try_into().expect("8-byte slice")))
    };
    match scheme {
        CompressionScheme::Plain => {
            let mut pos = 0;
            let mut out = Vec::with_capacity(valid);
            for _ in 0..valid {
                out.push(read_fixed(&mut pos)?);
            }
            Ok(out)
        }
        CompressionScheme::RunLength => {
            let mut out = Vec::with_capacity(valid);
            let mut pos = 0;
            while out.len() < valid {
                let value = read_fixed(&mut pos)?;
                let run = read_varint(bytes, &mut pos)? as usize;
                out.extend(std::iter::repeat(value).take(run));
            }
            expect_exact(out.len(), valid)?;
            Ok(out)
        }
        CompressionScheme::Dictionary => {
            let mut pos = 0;
            let count = read_u32(bytes, &mut pos)? as usize;
            let mut dict = Vec::with_capacity(count);
            for _ in 0..count {
                dict.push(read_fixed(&mut pos)?);
            }
            read_dict_codes(bytes, &mut pos, valid, &dict)
        }
        other => Err(unsupported(other, DataType::Float64)),
    }
}

fn decode_strings(bytes: &[u8], scheme: CompressionScheme, valid: usize) -> Result<Vec<String>> {
    match scheme {
        CompressionScheme::Plain => {
            let mut pos = 0;
            let mut out = Vec::with_capacity(valid);
            for _ in 0..valid {
                out.push(read_str(bytes, &mut pos)?);
            }
            Ok(out)
        }
        CompressionScheme::RunLength => {
            let mut out = Vec::with_capacity(valid);
            let mut pos = 0;
            while out.len() < valid {
                let value = read_str(bytes, &mut pos)?;
                let run = read_varint(bytes, &mut pos)? as usize;
                out.extend(std::iter::repeat(value).take(run));
            }
            expect_exact(out.len(), valid)?;
            Ok(out)
        }
        CompressionScheme::Dictionary => {
            let mut pos = 0;
            let count = read_u32(bytes, &mut pos)? as usize;
            let mut dict = Vec::with_capacity(count);
            for _ in 0..count {
                dict.push(read_str(bytes, &mut pos)?);
            }
            read_dict_codes(bytes, &mut pos, valid, &dict)
        }
        other => Err(unsupported(other, DataType::Utf8)),
    }
}

fn read_dict_codes<T: Clone>(
    bytes: &[u8],
    pos: &mut usize,
    valid: usize,
    dict: &[T],
) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(valid);
    for _ in 0..valid {
        let code = read_u32(bytes, pos)? as usize;
        let value = dict
            .get(code)
            .ok_or_else(|| CacheError::Serialization(format!("dictionary code {} out of range", code)))?;
        out.push(value.clone());
    }
    Ok(out)
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| CacheError::Serialization("u32 truncated".to_string()))?;
    *pos = end;
    Ok(u32::from_le_bytes(slice.try_into().expect("4-byte slice")))
}

fn read_str(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_u32(bytes, pos)? as usize;
    let end = *pos + len;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| CacheError::Serialization("string truncated".to_string()))?;
    *pos = end;
    String::from_utf8(slice.to_vec())
        .map_err(|e| CacheError::Serialization(format!("invalid utf8: {}", e)))
}

fn check_len(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() < expected {
        return Err(CacheError::Serialization(format!(
            "column needs {} bytes, has {}",
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

fn expect_exact(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(CacheError::Serialization(format!(
            "decoded {} values, expected {}",
            actual, expected
        )));
    }
    Ok(())
}

use chrono::{DateTime, Duration, SubsecRound, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use serde::{Deserialize, Deserializer};
use std::io::{Read, Write};

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_LEN: usize = 9;

/// 生成随机 base-36 ID（9 位，客户端生成）
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// 当前时间，截断到微秒（与 Postgres timestamptz 精度一致）
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// 生成严格晚于 `prev` 的时间戳，保证 updated_at 单调递增
pub fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = now_utc();
    if now > prev {
        now
    } else {
        prev.trunc_subsecs(6) + Duration::microseconds(1)
    }
}

/// 固定宽度的时间戳格式，用于 SQLite 列的字典序比较
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// 解析 RFC3339 时间戳（兼容 `Z` 与 `+00:00` 两种写法）
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc).trunc_subsecs(6))
}

/// 反序列化数组字段，处理 null 值
pub(crate) fn deserialize_vec_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// 反序列化标量或枚举字段，null 视为默认值（远端列可为空）
pub(crate) fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let opt = Option::<T>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// 数值字段兼容反序列化：历史数据中价格有时是数字，有时是字符串（可能带千分位逗号）
pub(crate) fn deserialize_flexible_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(f64),
        Str(String),
    }

    match Option::<NumOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("无法解析数值: {}", s)))
        }
    }
}

/// 解压 gzip 数据
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// 压缩数据为 gzip 格式
pub fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_base36() {
        let id = generate_id();
        assert_eq!(id.len(), 9);
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn next_timestamp_is_strictly_increasing() {
        let far_future = now_utc() + Duration::days(1);
        let next = next_timestamp(far_future);
        assert_eq!(next, far_future + Duration::microseconds(1));
        assert!(next_timestamp(now_utc()) > Utc::now() - Duration::seconds(1));
    }

    #[test]
    fn formatted_timestamps_sort_lexically() {
        let a = parse_ts("2024-12-13T14:22:38Z").unwrap();
        let b = parse_ts("2024-12-13T14:22:38.5+00:00").unwrap();
        assert!(format_ts(&a) < format_ts(&b));
        assert_eq!(format_ts(&a), "2024-12-13T14:22:38.000000Z");
    }

    #[test]
    fn flexible_numbers() {
        #[derive(Deserialize)]
        struct P {
            #[serde(default, deserialize_with = "deserialize_flexible_f64")]
            price: Option<f64>,
        }
        let parse = |s: &str| serde_json::from_str::<P>(s).unwrap().price;
        assert_eq!(parse(r#"{"price": 1500000}"#), Some(1_500_000.0));
        assert_eq!(parse(r#"{"price": "1,500,000"}"#), Some(1_500_000.0));
        assert_eq!(parse(r#"{"price": ""}"#), None);
        assert_eq!(parse(r#"{"price": null}"#), None);
        assert_eq!(parse(r#"{}"#), None);
        assert!(serde_json::from_str::<P>(r#"{"price": "abc"}"#).is_err());
    }

    #[test]
    fn gzip_restores_payload() {
        let payload = "عقار للبيع - property for sale".repeat(20);
        let packed = compress_gzip(payload.as_bytes()).unwrap();
        assert!(packed.len() < payload.len());
        assert_eq!(decompress_gzip(&packed).unwrap(), payload.as_bytes());
    }
}

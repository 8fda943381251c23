use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// 当前时间的 ISO-8601 (UTC, 毫秒精度, `Z` 结尾) 字符串
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 解析 RFC3339 时间字符串，失败返回 None
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳转 DateTime<Utc>，非法值回落到 epoch
pub fn millis_to_datetime(timestamp_ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(timestamp_ms) {
        chrono::LocalResult::Single(datetime) => datetime,
        _ => DateTime::<Utc>::default(),
    }
}

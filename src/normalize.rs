use crate::domain::ScrapedEvent;
use crate::scraper::validate_raw_event;
use crate::similarity::genre_token;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Converts one raw scraper output record into a ScrapedEvent observation.
/// Returns a human-readable reason when the record fails the execution
/// contract; callers drop such records with a warning rather than failing
/// the batch.
pub fn normalize_raw_event(raw: &serde_json::Value) -> Result<ScrapedEvent, String> {
    validate_raw_event(raw)?;

    let title = clean_string(raw.get("title")).ok_or("title is empty after trimming")?;
    let source_url = clean_string(raw.get("source_url")).ok_or("source_url is empty")?;

    let (event_day, start_time) = match clean_string(raw.get("starts_at")) {
        Some(ref ts) => parse_event_timestamp(ts)?,
        None => (None, None),
    };

    let genres = string_list(raw.get("genres"))
        .into_iter()
        .map(|g| genre_token(&g))
        .filter(|g| !g.is_empty())
        .collect();

    let artists = string_list(raw.get("artists"))
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();

    Ok(ScrapedEvent {
        title,
        event_day,
        start_time,
        source_url,
        description: clean_string(raw.get("description")),
        cover_charge: clean_string(raw.get("cover_charge")),
        image_url: clean_string(raw.get("image_url")),
        doors_time: clean_string(raw.get("doors_at")).and_then(|s| parse_time_component(&s)),
        end_time: clean_string(raw.get("ends_at")).and_then(|s| parse_time_component(&s)),
        ticket_url: clean_string(raw.get("ticket_url")),
        genres,
        artists,
        age_restriction: clean_string(raw.get("age_restriction")),
    })
}

/// Parses a scraped timestamp into day + time. A time component of exactly
/// 00:00 means the source had a date but no start time, so it maps to None.
fn parse_event_timestamp(
    raw: &str,
) -> Result<(Option<NaiveDate>, Option<NaiveTime>), String> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok((Some(dt.date()), demote_midnight(dt.time())));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M") {
        return Ok((Some(dt.date()), demote_midnight(dt.time())));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        let naive = dt.naive_local();
        return Ok((Some(naive.date()), demote_midnight(naive.time())));
    }
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok((Some(day), None));
    }
    Err(format!("unparseable starts_at '{}'", raw))
}

fn demote_midnight(time: NaiveTime) -> Option<NaiveTime> {
    if time == NaiveTime::MIN {
        None
    } else {
        Some(time)
    }
}

fn parse_time_component(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
                .ok()
                .map(|dt| dt.time())
        })
}

fn clean_string(value: Option<&serde_json::Value>) -> Option<String> {
    let trimmed = value?.as_str()?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_full_record() {
        let raw = json!({
            "title": "  Jazz Night ",
            "starts_at": "2025-11-01T20:00",
            "source_url": "https://venue.example/jazz",
            "genres": ["Jazz", "Hip Hop"],
            "artists": [" Nina Simone "]
        });
        let event = normalize_raw_event(&raw).unwrap();
        assert_eq!(event.title, "Jazz Night");
        assert_eq!(event.event_day, NaiveDate::from_ymd_opt(2025, 11, 1));
        assert_eq!(event.start_time, NaiveTime::from_hms_opt(20, 0, 0));
        assert_eq!(event.genres, vec!["jazz", "hip-hop"]);
        assert_eq!(event.artists, vec!["Nina Simone"]);
    }

    #[test]
    fn midnight_means_no_start_time() {
        let raw = json!({
            "title": "All Day Fest",
            "starts_at": "2025-11-01T00:00",
            "source_url": "https://venue.example/fest"
        });
        let event = normalize_raw_event(&raw).unwrap();
        assert_eq!(event.event_day, NaiveDate::from_ymd_opt(2025, 11, 1));
        assert_eq!(event.start_time, None);
    }

    #[test]
    fn bare_date_has_no_time() {
        let raw = json!({
            "title": "Matinee",
            "starts_at": "2025-11-02",
            "source_url": "https://venue.example/matinee"
        });
        let event = normalize_raw_event(&raw).unwrap();
        assert!(event.event_day.is_some());
        assert!(event.start_time.is_none());
    }

    #[test]
    fn contract_violations_are_reported_not_fatal() {
        assert!(normalize_raw_event(&json!({"title": "No URL"})).is_err());
        assert!(normalize_raw_event(&json!({
            "title": "   ",
            "source_url": "https://venue.example/x"
        }))
        .is_err());
    }

    #[test]
    fn unparseable_timestamp_is_rejected() {
        let raw = json!({
            "title": "Mystery Show",
            "starts_at": "next tuesday",
            "source_url": "https://venue.example/mystery"
        });
        assert!(normalize_raw_event(&raw).is_err());
    }
}

//! Glue between the wire-format article bytes and the three indices: pulls
//! the handful of headers the injection pipeline needs (`Message-ID`,
//! `Newsgroups`, `Expires`), builds the tab-separated overview line, and
//! stamps an `Xref` header recording which (group, article-number) pairs
//! an article was filed under so a later cancel can find them again
//! without a reverse index.

use crate::error::Error;

/// The headers the pipeline reads off an incoming article. Everything
/// else in the header block passes through to storage untouched.
pub struct ArticleHeaders {
    pub message_id: Option<String>,
    pub newsgroups: Vec<String>,
    pub subject: String,
    pub date: String,
    pub lines: Option<u64>,
    pub expires: Option<i64>,
}

fn header_end(article: &[u8]) -> Option<usize> {
    article.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 2)
}

fn find_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    for line in unfold(headers) {
        if let Some((key, value)) = line.split_once(':') {
            if key.eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Joins folded header continuation lines (leading whitespace) onto the
/// previous line, then yields one logical header per item.
fn unfold(headers: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in headers.split("\r\n") {
        if raw.is_empty() {
            continue;
        }
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !out.is_empty() {
            let last = out.last_mut().unwrap();
            last.push(' ');
            last.push_str(raw.trim_start());
        } else {
            out.push(raw.to_string());
        }
    }
    out
}

impl ArticleHeaders {
    /// Parses the header block of `article` (everything up to the first
    /// blank line). Returns `Error::Internal` if there is no blank line at
    /// all -- an article without a body separator is malformed, not just
    /// missing optional headers.
    pub fn parse(article: &[u8]) -> Result<Self, Error> {
        let end = header_end(article).ok_or_else(|| Error::internal("article has no header/body separator"))?;
        let text = String::from_utf8_lossy(&article[..end]).into_owned();

        let message_id = find_header(&text, "Message-ID").map(|s| s.to_string());
        let newsgroups = find_header(&text, "Newsgroups")
            .map(|s| s.split(',').map(|g| g.trim().to_string()).filter(|g| !g.is_empty()).collect())
            .unwrap_or_default();
        let subject = find_header(&text, "Subject").unwrap_or("").to_string();
        let date = find_header(&text, "Date").unwrap_or("").to_string();
        let lines = find_header(&text, "Lines").and_then(|s| s.parse().ok());
        let expires = find_header(&text, "Expires").and_then(parse_rfc5322_date);

        Ok(ArticleHeaders { message_id, newsgroups, subject, date, lines, expires })
    }

    /// Builds the tab-separated overview line for `number`: the classic
    /// `number\tSubject\tFrom\tDate\tMessage-ID\tReferences\tBytes\tLines`
    /// shape, CR-LF terminated.
    pub fn overview_line(&self, number: u64, from: &str, references: &str, bytes: u64) -> Vec<u8> {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\r\n",
            number,
            self.subject,
            from,
            self.date,
            self.message_id.as_deref().unwrap_or(""),
            references,
            bytes,
            self.lines.unwrap_or(0),
        )
        .into_bytes()
    }
}

const MONTHS: [&str; 12] =
    ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];

/// Days since the Unix epoch for civil date `year`-`month`-`day` (`month`
/// zero-based). Howard Hinnant's days-from-civil algorithm, proleptic
/// Gregorian, valid for the date ranges an `Expires` header can carry.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 1 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 10) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Very small subset of RFC 5322 date parsing: INN only needs `Expires` to
/// order against "now", not to round-trip every legal variant. Handles the
/// common `[Wkd,] DD Mon YYYY HH:MM[:SS] (+HHMM|-HHMM|GMT|UT)` shape;
/// anything else -- obsolete folding, military zone letters, two-digit
/// years -- falls back to "no expiry" rather than an error.
fn parse_rfc5322_date(s: &str) -> Option<i64> {
    let s = s.trim();
    let s = match s.split_once(',') {
        Some((_weekday, rest)) => rest.trim(),
        None => s,
    };

    let mut fields = s.split_whitespace();
    let day: i64 = fields.next()?.parse().ok()?;
    let month_name = fields.next()?;
    let month = MONTHS.iter().position(|m| m.eq_ignore_ascii_case(month_name))? as i64;
    let year: i64 = fields.next()?.parse().ok()?;
    let year = if year < 100 { if year < 50 { 2000 + year } else { 1900 + year } } else { year };

    let time = fields.next()?;
    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    let zone = fields.next().unwrap_or("+0000");
    let zone_offset = parse_zone_offset(zone)?;

    let days = days_from_civil(year, month, day);
    let seconds_of_day = hour * 3600 + minute * 60 + second;
    Some(days * 86400 + seconds_of_day - zone_offset)
}

/// Returns the zone's offset from UTC in seconds (so that `local - offset =
/// UTC`), for a numeric `+HHMM`/`-HHMM` zone or the common named zones.
fn parse_zone_offset(zone: &str) -> Option<i64> {
    if let Some(sign) = zone.chars().next().filter(|c| *c == '+' || *c == '-') {
        if zone.len() != 5 {
            return None;
        }
        let hh: i64 = zone[1..3].parse().ok()?;
        let mm: i64 = zone[3..5].parse().ok()?;
        let offset = hh * 3600 + mm * 60;
        return Some(if sign == '-' { -offset } else { offset });
    }
    match zone.to_ascii_uppercase().as_str() {
        "UT" | "GMT" | "UTC" | "Z" => Some(0),
        "EST" => Some(-5 * 3600),
        "EDT" => Some(-4 * 3600),
        "CST" => Some(-6 * 3600),
        "CDT" => Some(-5 * 3600),
        "MST" => Some(-7 * 3600),
        "MDT" => Some(-6 * 3600),
        "PST" => Some(-8 * 3600),
        "PDT" => Some(-7 * 3600),
        _ => None,
    }
}

/// Stamps an `Xref` header recording `host` and every `(group, number)`
/// pair an article was filed under, inserted as the first header line so
/// a later cancel can recover the group/number set from the stored bytes
/// alone.
pub fn inject_xref(article: &[u8], host: &str, assignments: &[(String, u64)]) -> Vec<u8> {
    let mut pairs = String::new();
    for (group, number) in assignments {
        if !pairs.is_empty() {
            pairs.push(' ');
        }
        pairs.push_str(&format!("{}:{}", group, number));
    }
    let xref = format!("Xref: {} {}\r\n", host, pairs);
    let mut out = Vec::with_capacity(xref.len() + article.len());
    out.extend_from_slice(xref.as_bytes());
    out.extend_from_slice(article);
    out
}

/// Parses the `group:number` pairs back out of a stored article's `Xref`
/// header, the information `cancel` needs to find every overview entry an
/// article produced.
pub fn parse_xref(article: &[u8]) -> Vec<(String, u64)> {
    let end = match header_end(article) {
        Some(e) => e,
        None => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&article[..end]).into_owned();
    let body = match find_header(&text, "Xref") {
        Some(b) => b,
        None => return Vec::new(),
    };

    let mut fields = body.split_whitespace();
    let _host = fields.next();
    fields
        .filter_map(|pair| {
            let (group, number) = pair.split_once(':')?;
            Some((group.to_string(), number.parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_id_and_crossposted_groups() {
        let article = b"Message-ID: <a@b>\r\nNewsgroups: misc.test, misc.other\r\nSubject: hi\r\n\r\nbody\r\n";
        let headers = ArticleHeaders::parse(article).unwrap();
        assert_eq!(headers.message_id.as_deref(), Some("<a@b>"));
        assert_eq!(headers.newsgroups, vec!["misc.test", "misc.other"]);
        assert_eq!(headers.subject, "hi");
    }

    #[test]
    fn folded_header_continuations_are_joined() {
        let article = b"Subject: a very\r\n long subject\r\n\r\nbody\r\n";
        let headers = ArticleHeaders::parse(article).unwrap();
        assert_eq!(headers.subject, "a very long subject");
    }

    #[test]
    fn expires_header_is_parsed_to_a_unix_timestamp() {
        let article = b"Subject: x\r\nExpires: Mon, 1 Jan 2024 00:00:00 GMT\r\n\r\nbody\r\n";
        let headers = ArticleHeaders::parse(article).unwrap();
        assert_eq!(headers.expires, Some(1_704_067_200));
    }

    #[test]
    fn expires_header_honors_numeric_zone_offset() {
        let article = b"Subject: x\r\nExpires: 1 Jan 2024 01:00:00 +0100\r\n\r\nbody\r\n";
        let headers = ArticleHeaders::parse(article).unwrap();
        assert_eq!(headers.expires, Some(1_704_067_200));
    }

    #[test]
    fn unparseable_expires_header_is_treated_as_no_expiry() {
        let article = b"Subject: x\r\nExpires: whenever\r\n\r\nbody\r\n";
        let headers = ArticleHeaders::parse(article).unwrap();
        assert_eq!(headers.expires, None);
    }

    #[test]
    fn missing_separator_is_an_error() {
        assert!(ArticleHeaders::parse(b"Subject: no body separator").is_err());
    }

    #[test]
    fn xref_round_trips_group_and_number_assignments() {
        let article = b"Subject: x\r\n\r\nbody\r\n";
        let assignments = vec![("misc.test".to_string(), 5u64), ("misc.other".to_string(), 12u64)];
        let stamped = inject_xref(article, "news.example.com", &assignments);
        assert!(stamped.starts_with(b"Xref: news.example.com "));
        assert_eq!(parse_xref(&stamped), assignments);
    }
}

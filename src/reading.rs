use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

// Line formatting: M/D/YYYY H:MM:SS (-)t.t
const DATE_DELIMITER: char = '/';
const TIME_DELIMITER: char = ':';
// Beyond any sensor scale; keeps hourly sums finite
const MAX_ABS_TEMPERATURE: f64 = 1_000.0;

/// One decoded sample from the log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub temperature: f64,
}

impl Reading {
    pub fn time_key(&self) -> TimeKey {
        TimeKey {
            year: self.year,
            month: self.month,
            day: self.day,
            hour: self.hour,
        }
    }

    pub fn month_key(&self) -> MonthKey {
        MonthKey { year: self.year, month: self.month }
    }
}

/// Aggregation bucket identity. Field order gives the (year, month, day, hour) ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeKey {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
}

impl TimeKey {
    pub fn month_key(&self) -> MonthKey {
        MonthKey { year: self.year, month: self.month }
    }
}

impl Display for TimeKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{} {:02}h", self.month, self.day, self.year, self.hour)
    }
}

/// Reporting window identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: u16,
    pub month: u8,
}

impl Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.month, self.year)
    }
}

fn split_triple(field: &str, delimiter: char) -> Option<(&str, &str, &str)> {
    let mut parts = field.splitn(3, delimiter);
    Some((parts.next()?, parts.next()?, parts.next()?))
}

fn parse_int<T: lexical_core::FromLexical>(value: &str) -> Option<T> {
    lexical_core::parse::<T>(value.as_bytes()).ok()
}

fn in_range(value: u8, low: u8, high: u8) -> Option<u8> {
    (low..=high).contains(&value).then_some(value)
}

/// Decodes one log line. `None` marks the line as invalid; nothing else is reported.
pub fn parse_line(line: &str) -> Option<Reading> {
    let mut fields = line.split_ascii_whitespace();
    let (date, time, temperature) = (fields.next()?, fields.next()?, fields.next()?);
    if fields.next().is_some() {
        return None;
    }

    let (month, day, year) = split_triple(date, DATE_DELIMITER)?;
    let (hour, minute, second) = split_triple(time, TIME_DELIMITER)?;
    let temperature = fast_float::parse::<f64, _>(temperature).ok()?;
    if !temperature.is_finite() || temperature.abs() > MAX_ABS_TEMPERATURE {
        return None;
    }

    Some(Reading {
        year: parse_int(year)?,
        month: in_range(parse_int(month)?, 1, 12)?,
        day: in_range(parse_int(day)?, 1, 31)?,
        hour: in_range(parse_int(hour)?, 0, 23)?,
        minute: in_range(parse_int(minute)?, 0, 59)?,
        second: in_range(parse_int(second)?, 0, 59)?,
        temperature,
    })
}

#[cfg(test)]
mod tests {

    use super::{parse_line, MonthKey, TimeKey};

    #[test]
    fn test_parse_line() {
        let reading = parse_line("7/4/2024 14:00:00 85.3").unwrap();
        assert_eq!((reading.month, reading.day, reading.year), (7, 4, 2024));
        assert_eq!((reading.hour, reading.minute, reading.second), (14, 0, 0));
        assert_eq!(reading.temperature, 85.3);

        let reading = parse_line("12/31/2023 23:59:59 -4.5\r").unwrap();
        assert_eq!(reading.temperature, -4.5);
        assert_eq!(reading.time_key(), TimeKey { year: 2023, month: 12, day: 31, hour: 23 });
        assert_eq!(reading.month_key(), MonthKey { year: 2023, month: 12 });

        assert_eq!(parse_line("01/02/2024 03:04:05 70").unwrap().temperature, 70.0);
    }

    #[test]
    fn test_parse_line_invalid() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("7/4/2024 14:00:00").is_none());
        assert!(parse_line("7/4/2024 14:00 85.3").is_none());
        assert!(parse_line("7-4-2024 14:00:00 85.3").is_none());
        assert!(parse_line("7/4/2024 14:00:00 hot").is_none());
        assert!(parse_line("7/4/2024 14:00:00 NaN").is_none());
        assert!(parse_line("13/4/2024 14:00:00 85.3").is_none());
        assert!(parse_line("7/4/2024 24:00:00 85.3").is_none());
        assert!(parse_line("7/4/2024 14:00:00 85.3 extra").is_none());
        assert!(parse_line("7/4/2024/1 14:00:00 85.3").is_none());
        assert!(parse_line("7/4/2024 14:00:00 1e308").is_none());
        assert!(parse_line("7/4/2024 14:00:00 -1000.5").is_none());
        assert_eq!(parse_line("7/4/2024 14:00:00 -1000").unwrap().temperature, -1000.0);
    }

    #[test]
    fn test_time_key_ordering() {
        let earlier = TimeKey { year: 2023, month: 12, day: 31, hour: 23 };
        let later = TimeKey { year: 2024, month: 1, day: 1, hour: 0 };
        assert!(earlier < later);
        assert!(TimeKey { hour: 5, ..later } > later);
        assert!(TimeKey { day: 2, ..later } > TimeKey { hour: 23, ..later });
    }
}

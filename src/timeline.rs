// Display ordering for a conversation
// Messages are ordered by timestamp (stable for ties) and partitioned by calendar day

use chrono::{DateTime, NaiveDate, TimeZone};
use std::fmt;

use crate::models::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayLabel {
    Today,
    Yesterday,
    Date(NaiveDate),
    /// Neither timestamp field was present
    Undated,
}

impl fmt::Display for DayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayLabel::Today => write!(f, "Today"),
            DayLabel::Yesterday => write!(f, "Yesterday"),
            DayLabel::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            DayLabel::Undated => write!(f, "Unknown date"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEntry<'a> {
    pub message: &'a Message,
    /// Only the last message of a day carries its time
    pub time_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DayGroup<'a> {
    pub label: DayLabel,
    pub entries: Vec<TimelineEntry<'a>>,
}

/// Group messages by calendar day as seen from `now`'s time zone
pub fn group_by_day<'a, Tz: TimeZone>(messages: &'a [Message], now: &DateTime<Tz>) -> Vec<DayGroup<'a>>
where
    Tz::Offset: fmt::Display,
{
    let tz = now.timezone();
    let today = now.date_naive();
    let yesterday = today.pred_opt();

    let mut ordered: Vec<&Message> = messages.iter().collect();
    // Stable: equal timestamps keep arrival order; undated messages go last
    ordered.sort_by_key(|m| (m.display_time().is_none(), m.display_time()));

    let mut groups: Vec<DayGroup<'a>> = Vec::new();
    for message in ordered {
        let label = match message.display_time() {
            Some(at) => {
                let day = at.with_timezone(&tz).date_naive();
                if day == today {
                    DayLabel::Today
                } else if Some(day) == yesterday {
                    DayLabel::Yesterday
                } else {
                    DayLabel::Date(day)
                }
            }
            None => DayLabel::Undated,
        };
        let entry = TimelineEntry { message, time_label: None };
        if let Some(group) = groups.last_mut().filter(|g| g.label == label) {
            group.entries.push(entry);
        } else {
            groups.push(DayGroup { label, entries: vec![entry] });
        }
    }

    for group in groups.iter_mut() {
        if let Some(last) = group.entries.last_mut() {
            last.time_label = last
                .message
                .display_time()
                .map(|at| at.with_timezone(&tz).format("%H:%M").to_string());
        }
    }
    groups
}

//! FITS header cards
//!
//! Header values pushed to the detector's header buffer. Keywords are stored
//! upper-case and keep insertion order, like a FITS header on disk.

use crate::error::{SubsystemError, SubsystemResult};
use crate::subsystem::Subsystem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-precision calendar format for timestamp cards (millisecond precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Scheduler keyword carrying the target name
pub const OBJECT_KEYWORD: &str = "OBJECT";

/// FITS value types.
///
/// A JSON string always reads back as `String`, even when it looks like a
/// date. Timestamp cards are only produced in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl HeaderValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Value as it is written into the card
    pub fn to_card_string(&self) -> String {
        match self {
            HeaderValue::String(s) => format!("'{}'", s),
            HeaderValue::Integer(i) => i.to_string(),
            HeaderValue::Float(f) => format!("{:.10E}", f),
            HeaderValue::Boolean(b) => if *b { "T".to_string() } else { "F".to_string() },
            HeaderValue::Timestamp(t) => format!("'{}'", t.format(TIMESTAMP_FORMAT)),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Integer(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Integer(value as i64)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Boolean(value)
    }
}

impl From<DateTime<Utc>> for HeaderValue {
    fn from(value: DateTime<Utc>) -> Self {
        HeaderValue::Timestamp(value)
    }
}

/// One keyword/value card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCard {
    pub keyword: String,
    pub value: HeaderValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl HeaderCard {
    /// Build a card, rejecting an empty keyword or a missing value
    pub fn try_new(keyword: &str, value: Option<HeaderValue>) -> SubsystemResult<Self> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(SubsystemError::invalid_argument(
                Subsystem::Detector,
                "FITS keyword is empty",
            ));
        }
        let value = value.ok_or_else(|| {
            SubsystemError::invalid_argument(
                Subsystem::Detector,
                format!("FITS keyword {} has no value", keyword),
            )
        })?;
        Ok(Self {
            keyword: keyword.to_uppercase(),
            value,
            comment: None,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Ordered set of cards. Setting an existing keyword replaces it in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderList {
    cards: Vec<HeaderCard>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, card: HeaderCard) {
        match self.cards.iter_mut().find(|c| c.keyword == card.keyword) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        let keyword = keyword.to_uppercase();
        self.cards
            .iter()
            .find(|c| c.keyword == keyword)
            .map(|c| &c.value)
    }

    /// OBJECT value, if present as a string
    pub fn object_name(&self) -> Option<&str> {
        self.get(OBJECT_KEYWORD).and_then(|v| v.as_string())
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn into_cards(self) -> Vec<HeaderCard> {
        self.cards
    }
}

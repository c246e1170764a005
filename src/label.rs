//! # Label Module
//!
//! Labels partition a continuous recording into named half-open intervals
//! `[start_ms, end_ms)`. A session keeps them in a `LabelBook`, which
//! enforces the ordering rules:
//!
//! - labels are ordered by start time and never overlap
//! - at most one label is open (`end_ms == None`) at a time
//! - opening a label closes the previous one at the same instant

use crate::error::SessionError;
use std::fmt;
use std::sync::Arc;

/// Stable position of a label inside its session's `LabelBook`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub usize);

/// A named interval of the recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub id: LabelId,
    pub name: Arc<str>,
    pub start_ms: i64,
    pub end_ms: Option<i64>,
}

impl Label {
    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    pub fn to_ref(&self) -> LabelRef {
        LabelRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// Lightweight reference to a label carried by samples and timeframes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelRef {
    pub id: LabelId,
    pub name: Arc<str>,
}

impl LabelRef {
    pub fn new(id: LabelId, name: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for LabelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Ordered, non-overlapping sequence of labels for one session
#[derive(Debug, Default)]
pub struct LabelBook {
    labels: Vec<Label>,
}

impl LabelBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the open label (if any) at `time_ms` and open a new one there.
    ///
    /// Returns the label that was closed, so the caller can persist it, and a
    /// reference to the new label.
    pub fn begin(
        &mut self,
        name: &str,
        time_ms: i64,
    ) -> Result<(Option<Label>, LabelRef), SessionError> {
        let label_ref = self.next_ref(name, time_ms)?;
        let closed = self.close_open(time_ms);

        self.labels.push(Label {
            id: label_ref.id,
            name: label_ref.name.clone(),
            start_ms: time_ms,
            end_ms: None,
        });
        Ok((closed, label_ref))
    }

    /// Reference the label that `begin(name, time_ms)` would open, without
    /// changing the book. Fails the same way `begin` would.
    pub fn next_ref(&self, name: &str, time_ms: i64) -> Result<LabelRef, SessionError> {
        self.check_order(time_ms)?;
        Ok(LabelRef::new(LabelId(self.labels.len()), name))
    }

    /// Close the open label without opening another one
    pub fn end(&mut self, time_ms: i64) -> Result<Option<Label>, SessionError> {
        if self.open().is_some() {
            self.check_order(time_ms)?;
        }
        Ok(self.close_open(time_ms))
    }

    pub fn open(&self) -> Option<&Label> {
        self.labels.last().filter(|label| label.is_open())
    }

    pub fn get(&self, id: LabelId) -> Option<&Label> {
        self.labels.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn check_order(&self, time_ms: i64) -> Result<(), SessionError> {
        if let Some(last) = self.labels.last() {
            let previous = last.end_ms.unwrap_or(last.start_ms);
            if time_ms < previous {
                return Err(SessionError::LabelOutOfOrder {
                    previous,
                    requested: time_ms,
                });
            }
        }
        Ok(())
    }

    fn close_open(&mut self, time_ms: i64) -> Option<Label> {
        let last = self.labels.last_mut().filter(|label| label.is_open())?;
        last.end_ms = Some(time_ms);
        Some(last.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_count(book: &LabelBook) -> usize {
        book.iter().filter(|l| l.is_open()).count()
    }

    #[test]
    fn test_begin_closes_previous() {
        let mut book = LabelBook::new();
        let (closed, first) = book.begin("sitting", 100).unwrap();
        assert!(closed.is_none());
        assert_eq!(first.id, LabelId(0));

        let (closed, second) = book.begin("walking", 250).unwrap();
        let closed = closed.expect("previous label should be closed");
        assert_eq!(closed.name.as_ref(), "sitting");
        assert_eq!(closed.end_ms, Some(250));
        assert_eq!(second.id, LabelId(1));
        assert_eq!(open_count(&book), 1);
        assert_eq!(book.open().map(|l| l.start_ms), Some(250));
    }

    #[test]
    fn test_end_without_open_label() {
        let mut book = LabelBook::new();
        assert!(book.end(10).unwrap().is_none());
        book.begin("a", 10).unwrap();
        let closed = book.end(20).unwrap().unwrap();
        assert_eq!(closed.end_ms, Some(20));
        assert!(book.open().is_none());
        assert!(book.end(30).unwrap().is_none());
    }

    #[test]
    fn test_rejects_overlap() {
        let mut book = LabelBook::new();
        book.begin("a", 100).unwrap();
        let err = book.begin("b", 50).unwrap_err();
        assert!(matches!(
            err,
            SessionError::LabelOutOfOrder {
                previous: 100,
                requested: 50
            }
        ));
        // Book unchanged
        assert_eq!(book.len(), 1);
        assert!(book.open().is_some());
    }

    #[test]
    fn test_next_ref_matches_begin_without_changing_book() {
        let mut book = LabelBook::new();
        book.begin("a", 100).unwrap();

        let next = book.next_ref("b", 150).unwrap();
        assert_eq!(book.len(), 1);
        assert!(book.open().is_some_and(|l| l.end_ms.is_none()));
        assert!(book.next_ref("b", 99).is_err());

        let (_, opened) = book.begin("b", 150).unwrap();
        assert_eq!(opened, next);
    }

    #[test]
    fn test_at_most_one_open_label() {
        let mut book = LabelBook::new();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            book.begin(name, i as i64 * 10).unwrap();
            assert_eq!(open_count(&book), 1);
        }
        let labels: Vec<_> = book.iter().cloned().collect();
        for pair in labels.windows(2) {
            assert!(pair[0].end_ms.unwrap() <= pair[1].start_ms);
        }
    }
}

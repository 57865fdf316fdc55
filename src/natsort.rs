//! Natural ("human") ordering of version strings.
//!
//! `v1.10` sorts after `v1.9` because digit runs are compared by value.

use std::cmp::Ordering;

/// Compares two strings chunk by chunk, treating runs of ASCII digits as
/// numbers. Equal-valued chunks (`01` vs `1`) fall back to a byte comparison
/// so the ordering stays total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = Chunks::new(a);
    let mut right = Chunks::new(b);

    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(Chunk::Number(x)), Some(Chunk::Number(y))) => compare_digits(x, y),
            (Some(Chunk::Number(_)), Some(Chunk::Text(_))) => Ordering::Less,
            (Some(Chunk::Text(_)), Some(Chunk::Number(_))) => Ordering::Greater,
            (Some(Chunk::Text(x)), Some(Chunk::Text(y))) => x.cmp(y),
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

/// Orders `tags` newest-first by natural order and keeps at most `limit`.
pub fn latest_first(mut tags: Vec<String>, limit: usize) -> Vec<String> {
    tags.sort_by(|a, b| natural_cmp(b, a));
    tags.truncate(limit);
    tags
}

fn compare_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');

    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[derive(Debug, PartialEq)]
enum Chunk<'a> {
    Number(&'a str),
    Text(&'a str),
}

struct Chunks<'a> {
    rest: &'a str,
}

impl<'a> Chunks<'a> {
    fn new(value: &'a str) -> Self {
        Self { rest: value }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.rest.chars().next()?;
        let numeric = first.is_ascii_digit();

        let end = self
            .rest
            .find(|c: char| c.is_ascii_digit() != numeric)
            .unwrap_or(self.rest.len());
        let (chunk, rest) = self.rest.split_at(end);
        self.rest = rest;

        Some(if numeric {
            Chunk::Number(chunk)
        } else {
            Chunk::Text(chunk)
        })
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! report.rs
//!
//! Per pass summary of what happened to each resource.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Deleted,
    Modified,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub rsc_name: String,
    pub message: String,
    pub cause: Option<String>,
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Report {
    entries: Vec<Entry>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: EntryKind, rsc_name: &str, message: String, cause: Option<&str>) {
        self.entries.push(Entry {
            kind,
            rsc_name: rsc_name.to_string(),
            message,
            cause: cause.map(str::to_string),
        });
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn for_resource<'a>(&'a self, rsc_name: &'a str) -> impl Iterator<Item = &'a Entry> {
        self.entries.iter().filter(move |e| e.rsc_name == rsc_name)
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.kind == EntryKind::Error)
    }

    pub fn merge(&mut self, other: Report) {
        self.entries.extend(other.entries);
    }
}

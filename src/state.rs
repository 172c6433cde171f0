// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeMap,
    fmt,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    sync::{Mutex, PoisonError},
};

use chrono::{Local, NaiveDateTime};
use log::debug;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%f";

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("could not open statefile path '{path}': {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to read statefile: {0}")]
    Read(std::io::Error),

    #[error("failed to write to statefile: {0}")]
    Write(std::io::Error),

    #[error("failed parsing record from '{line}': {reason}")]
    Parse { line: String, reason: String },
}

/// Satellite owned properties, persisted as an append-only log of records.
///
/// On start-up the records are replayed in timestamp order; every later change appends one more
/// record before the in-memory map is updated.
#[derive(Debug)]
pub struct State {
    /// File that stores state. `None` keeps the properties in memory only.
    file: Option<Mutex<File>>,
    values: Mutex<BTreeMap<String, String>>,
}

impl State {
    pub fn new(path: &str) -> Result<Self, StateError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|source| StateError::Open {
                path: path.to_string(),
                source,
            })?;
        let values = replay(Record::get_all_from_file(&file)?);
        debug!("loaded {} properties from statefile '{path}'", values.len());
        Ok(Self {
            file: Some(Mutex::new(file)),
            values: Mutex::new(values),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            file: None,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        self.write_record(Record::new(Event::Set, key, Some(value)))?;
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Removing a key that is not present writes nothing.
    pub fn remove(&self, key: &str) -> Result<(), StateError> {
        if self.get(key).is_none() {
            return Ok(());
        }
        self.write_record(Record::new(Event::Remove, key, None))?;
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    /// All properties whose key starts with `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Writes a single record to the statefile.
    fn write_record(&self, record: Record) -> Result<(), StateError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        file.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(&[record.as_string().as_bytes(), b"\n"].concat())
            .map_err(StateError::Write)
    }
}

/// Fold a sorted list of records into the current property map.
pub fn replay(records: Vec<Record>) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for record in records {
        match record.event {
            Event::Set => {
                values.insert(record.key, record.value.unwrap_or_default());
            }
            Event::Remove => {
                values.remove(&record.key);
            }
        }
    }
    values
}

/// An single record of a property change that is tracked in the statefile.
#[derive(Debug, PartialEq)]
pub struct Record {
    pub timestamp: NaiveDateTime,
    pub event: Event,
    pub key: String,
    pub value: Option<String>,
}

impl Record {
    pub fn new(event: Event, key: &str, value: Option<&str>) -> Self {
        Record {
            timestamp: Local::now().naive_local(),
            event,
            key: key.to_string(),
            value: value.map(str::to_string),
        }
    }

    /// Attempt to get all Records from a File, sorted by timestamp in ascending order.
    pub fn get_all_from_file(file: &File) -> Result<Vec<Record>, StateError> {
        let mut records = BufReader::new(file)
            .lines()
            .filter(|line| !matches!(line, Ok(l) if l.is_empty()))
            .map(|line| Record::from_string(&line.map_err(StateError::Read)?))
            .collect::<Result<Vec<Record>, StateError>>()?;
        // Stable sort, so records with equal timestamps keep their order in the file.
        records.sort_by_key(|record| record.timestamp);

        Ok(records)
    }

    /// Create a String from a Record.
    pub fn as_string(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.event,
            self.key,
            self.value.as_deref().unwrap_or(""),
        )
    }

    /// Create a Record from a &str.
    pub fn from_string(record: &str) -> Result<Self, StateError> {
        let parse_err = |reason: &str| StateError::Parse {
            line: record.to_string(),
            reason: reason.to_string(),
        };
        let mut fields = record.splitn(4, '\t');
        let timestamp = fields.next().ok_or_else(|| parse_err("missing timestamp"))?;
        let event = fields.next().ok_or_else(|| parse_err("missing event"))?;
        let key = fields.next().ok_or_else(|| parse_err("missing key"))?;
        let value = fields.next();

        let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .map_err(|e| parse_err(&format!("bad timestamp: {e}")))?;
        let event = Event::try_from(event).map_err(|_| parse_err("unknown event"))?;

        Ok(Self {
            timestamp,
            value: match event {
                Event::Set => Some(value.unwrap_or("").to_string()),
                Event::Remove => None,
            },
            event,
            key: key.to_string(),
        })
    }
}

/// All possible events that can be represented in the statefile.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Event {
    Set,
    Remove,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Self::Set => "set",
                Self::Remove => "remove",
            }
        )
    }
}

impl TryFrom<&str> for Event {
    type Error = ();
    fn try_from(val: &str) -> Result<Self, Self::Error> {
        match val {
            "set" => Ok(Self::Set),
            "remove" => Ok(Self::Remove),
            _ => Err(()),
        }
    }
}

//! Broker address strings.
//!
//! An address names either a queue-like destination (`"task.feedback"`) or a
//! topic binding on an exchange (`"lofar.bus/task.specified"`), optionally
//! followed by `;<broker-options>` that are passed to the broker verbatim.
//! Addresses are parsed exactly once, at bind time, and never mutated.

use std::fmt;
use std::str::FromStr;

use crate::error::BusError;

/// A parsed broker address: `subject`, `bus/subject`, or either form with a
/// trailing `;options` segment.
///
/// The first `/` separates the bus (topic exchange) from the subject; the
/// first `;` starts the broker-options segment, which is kept verbatim and
/// never interpreted by this layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    bus: Option<String>,
    subject: String,
    options: Option<String>,
}

impl Address {
    /// Parse an address string. Fails with [`BusError::InvalidAddress`] when
    /// the subject (or a named bus) is empty.
    pub fn parse(input: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidAddress(input.to_string());

        let (body, options) = match input.split_once(';') {
            Some((body, opts)) => (body, Some(opts.to_string())),
            None => (input, None),
        };

        let (bus, subject) = match body.split_once('/') {
            Some((bus, subject)) => {
                if bus.is_empty() {
                    return Err(invalid());
                }
                (Some(bus.to_string()), subject)
            }
            None => (None, body),
        };
        if subject.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            bus,
            subject: subject.to_string(),
            options,
        })
    }

    /// The topic exchange this address binds on, when it is a `bus/subject`
    /// form.
    #[must_use]
    pub fn bus(&self) -> Option<&str> {
        self.bus.as_deref()
    }

    /// The queue name or routing key.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The raw `;options` segment, if any, without the leading `;`.
    #[must_use]
    pub fn options(&self) -> Option<&str> {
        self.options.as_deref()
    }

    /// Whether this address names a topic binding (`bus/subject`) rather
    /// than a plain queue.
    #[must_use]
    pub fn is_topic(&self) -> bool {
        self.bus.is_some()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(bus) = &self.bus {
            write!(f, "{bus}/")?;
        }
        write!(f, "{}", self.subject)?;
        if let Some(options) = &self.options {
            write!(f, ";{options}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

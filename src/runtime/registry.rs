//! Topic-filter subscription registry.

use heapless::String;

use crate::error::RegistryError;
use crate::packet::Publish;
use crate::topic;

/// Maximum length for a single topic filter.
pub const MAX_FILTER_LEN: usize = 128;

/// Number of subscription records used when none is configured.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 5;

struct SubscriptionRecord<H> {
    filter: String<MAX_FILTER_LEN>,
    handler: H,
}

/// A fixed-capacity table of (topic filter, handler) records.
///
/// The registry owns the filter strings (copies them on register). No two
/// live records share a byte-identical filter. Records are scanned in slot
/// order, and a freed slot is reused by the next registration, so dispatch
/// order is deterministic but not necessarily registration order.
///
/// The registry does no locking of its own; `OtaContext` keeps it behind a
/// mutex so registration and dispatch can run from different contexts.
///
/// # Example
///
/// ```ignore
/// let mut registry = SubscriptionRegistry::<OtaHandler, 5>::new();
/// registry.register("$aws/things/dev/jobs/notify-next", OtaHandler::Jobs)?;
///
/// registry.dispatch(&msg, |handler, msg| router.route(*handler, msg));
/// ```
pub struct SubscriptionRegistry<H, const K: usize = DEFAULT_MAX_SUBSCRIPTIONS> {
    records: [Option<SubscriptionRecord<H>>; K],
}

impl<H, const K: usize> SubscriptionRegistry<H, K> {
    /// Create a new empty registry.
    pub const fn new() -> Self {
        Self {
            records: [const { None }; K],
        }
    }

    /// Binds `handler` to `filter`.
    ///
    /// An existing record with the same filter is reported as
    /// [`RegistryError::RecordExists`] even when the registry is full, so
    /// re-registering never fails with [`RegistryError::RegistryFull`].
    pub fn register(&mut self, filter: &str, handler: H) -> Result<(), RegistryError> {
        if filter.is_empty() || filter.len() > MAX_FILTER_LEN {
            warn!("rejected topic filter of {} bytes", filter.len());
            return Err(RegistryError::InvalidFilter);
        }

        let mut available = None;
        for (index, slot) in self.records.iter().enumerate() {
            match slot {
                None if available.is_none() => available = Some(index),
                Some(record) if record.filter.as_str() == filter => {
                    debug!("record for topic filter already exists: {}", filter);
                    return Err(RegistryError::RecordExists);
                }
                _ => {}
            }
        }

        let Some(index) = available else {
            debug!("registry full ({} records), cannot add {}", K, filter);
            return Err(RegistryError::RegistryFull);
        };

        let mut owned = String::new();
        owned
            .push_str(filter)
            .map_err(|_| RegistryError::InvalidFilter)?;
        self.records[index] = Some(SubscriptionRecord {
            filter: owned,
            handler,
        });

        debug!("added handler for topic filter {} in slot {}", filter, index);
        Ok(())
    }

    /// Removes the record for `filter`.
    ///
    /// Returns `false` if no record matched; that is not an error.
    pub fn remove(&mut self, filter: &str) -> bool {
        let slot = self
            .records
            .iter_mut()
            .find(|slot| matches!(slot, Some(record) if record.filter.as_str() == filter));

        match slot {
            Some(slot) => {
                *slot = None;
                debug!("removed handler for topic filter {}", filter);
                true
            }
            None => {
                debug!("no handler registered for topic filter {}", filter);
                false
            }
        }
    }

    /// Invokes `handle` for every record whose filter matches the message topic.
    ///
    /// More than one handler fires when filters overlap. Returns the number of
    /// handlers invoked.
    pub fn dispatch<F>(&self, msg: &Publish<'_>, mut handle: F) -> usize
    where
        F: FnMut(&H, &Publish<'_>),
    {
        let mut invoked = 0;
        for record in self.records.iter().flatten() {
            if topic::matches(msg.topic, &record.filter) {
                trace!(
                    "invoking handler of filter {} for topic {}",
                    record.filter.as_str(),
                    msg.topic
                );
                handle(&record.handler, msg);
                invoked += 1;
            }
        }
        invoked
    }

    /// Handlers whose filter matches `topic`, in dispatch order.
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a H> + 'a {
        self.records
            .iter()
            .flatten()
            .filter(move |record| topic::matches(topic, &record.filter))
            .map(|record| &record.handler)
    }

    /// The handler bound to exactly `filter`.
    pub fn handler(&self, filter: &str) -> Option<&H> {
        self.iter()
            .find(|(registered, _)| *registered == filter)
            .map(|(_, handler)| handler)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.handler(filter).is_some()
    }

    /// Get an iterator over the live records.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &H)> {
        self.records
            .iter()
            .flatten()
            .map(|record| (record.filter.as_str(), &record.handler))
    }

    /// Get the number of live records.
    pub fn len(&self) -> usize {
        self.records.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        K
    }

    /// Clear all records.
    pub fn clear(&mut self) {
        self.records.iter_mut().for_each(|slot| *slot = None);
    }
}

impl<H, const K: usize> Default for SubscriptionRegistry<H, K> {
    fn default() -> Self {
        Self::new()
    }
}

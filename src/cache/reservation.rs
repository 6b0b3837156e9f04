//! Space reservations.
//!
//! A [`Reservation`] is a catalog-tracked claim on bytes in one volume. Its
//! owner writes objects through [`Reservation::save_as`], which streams the
//! bytes into the volume, verifies them, catalogues them and debits the
//! claim. The claim is resolved either by being consumed or by
//! [`Reservation::drop_reservation`]; an unresolved reservation releases its
//! share when dropped.
//!
//! A save proceeds as write, then verify, then catalogue. A failure at any
//! step removes the written bytes, along with any catalog entry for the
//! object they overwrote, and leaves the allowance untouched.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, info, warn};

use crate::cache::object::{
    iso_instant, metadatum_i64, now_millis, CachedObject, Metadata, CHECKED, SINCE, SINCE_DATE,
    SIZE,
};
use crate::cache::observer::Observers;
use crate::error::{CacheError, Result};
use crate::integrity::IntegrityMonitor;
use crate::inventory::SharedCatalog;
use crate::metrics::CacheMetrics;
use crate::volume::CacheVolume;

/// Name of the shared per-volume claim created by [`Reservation::reservation_for`].
pub const RESERVATION_NAME: &str = "_reservation";

/// Prefix for ad hoc claims made with [`generate_name`].
pub const RESERVATION_PREFIX: &str = "_reserv,";

/// `prefix` followed by `len` random alphanumeric characters.
pub fn generate_name(prefix: &str, len: usize) -> String {
    let mut out = String::with_capacity(prefix.len() + len);
    out.push_str(prefix);
    while out.len() < prefix.len() + len {
        let chunk = uuid::Uuid::new_v4().simple().to_string();
        let need = prefix.len() + len - out.len();
        out.extend(chunk.chars().take(need));
    }
    out
}

/// Counts bytes as they are read through it.
struct CountingReader<'a> {
    inner: &'a mut (dyn AsyncRead + Send + Unpin),
    count: u64,
}

impl<'a> CountingReader<'a> {
    fn new(inner: &'a mut (dyn AsyncRead + Send + Unpin)) -> Self {
        Self { inner, count: 0 }
    }
}

impl AsyncRead for CountingReader<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let polled = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            this.count += (buf.filled().len() - before) as u64;
        }
        polled
    }
}

/// A provisional claim on space in one volume.
pub struct Reservation {
    volume: Arc<dyn CacheVolume>,
    catalog: SharedCatalog,
    name: String,
    allotted: i64,
    remaining: i64,
    released: bool,
    checker: Option<Arc<IntegrityMonitor>>,
    observers: Option<Arc<Observers>>,
    metrics: Option<CacheMetrics>,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("volume", &self.volume.name())
            .field("name", &self.name)
            .field("allotted", &self.allotted)
            .field("remaining", &self.remaining)
            .field("released", &self.released)
            .finish()
    }
}

impl Reservation {
    /// Claim `size` bytes in `volume` under the shared per-volume name,
    /// growing the existing claim if there is one.
    pub fn reservation_for(
        volume: Arc<dyn CacheVolume>,
        catalog: SharedCatalog,
        size: u64,
    ) -> Result<Self> {
        Self::named(volume, catalog, RESERVATION_NAME, size)
    }

    /// Claim `size` bytes in `volume` under `name`.
    pub fn named(
        volume: Arc<dyn CacheVolume>,
        catalog: SharedCatalog,
        name: &str,
        size: u64,
    ) -> Result<Self> {
        let total = catalog.reserve(volume.name(), name, size)?;
        info!(volume = %volume.name(), reservation = name, size, total, "space reserved");
        Ok(Self {
            volume,
            catalog,
            name: name.to_string(),
            allotted: size as i64,
            remaining: size as i64,
            released: false,
            checker: None,
            observers: None,
            metrics: None,
        })
    }

    /// Verify every saved object with `checker` before cataloguing it.
    pub fn with_checker(mut self, checker: Arc<IntegrityMonitor>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_observers(mut self, observers: Arc<Observers>) -> Self {
        self.observers = Some(observers);
        self
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_name(&self) -> &str {
        self.volume.name()
    }

    /// Remaining allowance; negative once writes have overrun it.
    pub fn size(&self) -> i64 {
        self.remaining
    }

    pub fn allotted(&self) -> i64 {
        self.allotted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stream `from` into the volume as `name` and catalogue it under `id`.
    ///
    /// A declared `size` in `metadata` must match the bytes actually
    /// written. The allowance may be overrun by at most its original
    /// allotment; beyond that the save is refused.
    pub async fn save_as(
        &mut self,
        from: &mut (dyn AsyncRead + Send + Unpin),
        id: &str,
        name: &str,
        metadata: Option<&Metadata>,
    ) -> Result<CachedObject> {
        let volume = self.volume.name().to_string();
        if self.released {
            return Err(CacheError::management(format!(
                "reservation {} in {volume} already released",
                self.name
            )));
        }
        if self.remaining <= 0 {
            return Err(CacheError::management(format!(
                "No more space in reservation {} to save {id}",
                self.name
            )));
        }
        let expected = match metadata {
            Some(md) => metadatum_i64(md, SIZE)?.filter(|s| *s >= 0),
            None => None,
        };

        let mut counter = CountingReader::new(from);
        self.volume.save_as(&mut counter, name, metadata).await?;
        let written = counter.count;
        debug!(volume = %volume, id, name, bytes = written, "wrote reserved object");

        if let Some(exp) = expected {
            if (exp as u64) != written {
                self.discard(name).await;
                let which = if written < exp as u64 { "few" } else { "many" };
                return Err(CacheError::management(format!(
                    "Too {which} bytes written for {id}; {written} != {exp}"
                )));
            }
        }
        if self.remaining - (written as i64) < -self.allotted {
            self.discard(name).await;
            return Err(CacheError::management(format!(
                "No more space in reservation {} to save {id} ({written} bytes)",
                self.name
            )));
        }

        let now = now_millis();
        let mut md = metadata.cloned().unwrap_or_default();
        md.insert(SIZE.into(), Value::from(written));
        md.insert(SINCE.into(), Value::from(now));
        md.insert(SINCE_DATE.into(), Value::from(iso_instant(now)));

        if let Some(checker) = &self.checker {
            let candidate = CachedObject::from_metadata(&volume, name, Some(id.to_string()), &md)?;
            if let Err(e) = checker.verify(&candidate, self.volume.as_ref()).await {
                warn!(volume = %volume, id, name, error = %e, "saved object failed verification");
                self.discard(name).await;
                return Err(e);
            }
            md.insert(CHECKED.into(), Value::from(now));
        }

        let obj = match self.catalog.add_object(id, &volume, name, Some(&md)) {
            Ok(obj) => obj,
            Err(e) => {
                self.discard(name).await;
                return Err(CacheError::management(format!(
                    "Problem updating inventory for id={id}: {e} (aborted save)"
                )));
            }
        };

        let share = self.remaining.max(0) as u64;
        self.catalog
            .debit_reservation(&volume, &self.name, written.min(share))?;
        self.remaining -= written as i64;

        info!(
            volume = %volume,
            id,
            name,
            bytes = written,
            remaining = self.remaining,
            "object saved"
        );
        if let Some(m) = &self.metrics {
            m.record_save(&volume, written);
        }
        if let Some(obs) = &self.observers {
            obs.object_saved(&obj);
        }
        Ok(obj)
    }

    /// Give back whatever part of the claim is unused.
    pub fn drop_reservation(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.remaining > 0 {
            self.catalog
                .debit_reservation(self.volume.name(), &self.name, self.remaining as u64)?;
            debug!(
                volume = %self.volume.name(),
                reservation = %self.name,
                released = self.remaining,
                "reservation dropped"
            );
        }
        Ok(())
    }

    /// Remove rejected bytes. The write replaced anything stored under
    /// `name`, so a catalog entry for it no longer describes real bytes
    /// and goes too.
    async fn discard(&self, name: &str) {
        let volume = self.volume.name();
        if let Err(e) = self.volume.remove(name).await {
            warn!(volume = %volume, name, error = %e, "could not remove rejected object");
        }
        match self.catalog.remove_object(volume, name) {
            Ok(true) => warn!(volume = %volume, name, "rejected save replaced a catalogued object; entry removed"),
            Ok(false) => {}
            Err(e) => warn!(volume = %volume, name, error = %e, "could not remove catalog entry for rejected object"),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Err(e) = self.drop_reservation() {
            warn!(reservation = %self.name, error = %e, "failed to release reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_name() {
        let a = generate_name(RESERVATION_PREFIX, 8);
        let b = generate_name(RESERVATION_PREFIX, 8);
        assert_eq!(a.len(), 16);
        assert!(a.starts_with(RESERVATION_PREFIX));
        assert!(a[RESERVATION_PREFIX.len()..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(generate_name("x", 70).len(), 71);
    }
}

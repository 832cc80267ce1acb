//! Advisory abuse and compliance signals.
//!
//! Guardrails look at a reporting period `[from, to)` of history and flag:
//! - providers declining most of what they answer
//! - providers cancelling after confirmation
//! - clients creating bookings they leave in draft
//! - clients cancelling after confirmation
//!
//! Flags never block anything; they are surfaced to operators through [`GuardrailReport`].

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::booking::{BookingRequest, BookingStatus, BookingStatusChange, StatusActor};
use crate::errors::{Error, Result};
use crate::invitation::{AnyInvitation, InvitationStatus};
use crate::storage::Storage;
use crate::types::{ClientId, ProviderId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailThresholds {
    /// Minimum answered invitations before a decline rate is judged
    pub provider_min_responses: u32,
    pub provider_decline_ratio: f64,
    pub provider_cancellations: u32,
    pub client_draft_bookings: u32,
    pub client_cancellations: u32,
}

impl Default for GuardrailThresholds {
    fn default() -> Self {
        Self {
            provider_min_responses: 3,
            provider_decline_ratio: 0.7,
            provider_cancellations: 2,
            client_draft_bookings: 3,
            client_cancellations: 2,
        }
    }
}

impl GuardrailThresholds {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.provider_decline_ratio) {
            return Err(Error::Validation {
                message: format!(
                    "guardrails.provider_decline_ratio must be within [0, 1], got {}",
                    self.provider_decline_ratio
                ),
            });
        }
        if self.provider_min_responses == 0
            || self.provider_cancellations == 0
            || self.client_draft_bookings == 0
            || self.client_cancellations == 0
        {
            return Err(Error::Validation {
                message: "guardrail count thresholds must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailKind {
    ProviderDeclineRate,
    ProviderCancellations,
    ClientDraftSpam,
    ClientCancellations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum FlaggedEntity {
    Provider(ProviderId),
    Client(ClientId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailFlag {
    pub kind: GuardrailKind,
    pub entity: FlaggedEntity,
    /// Offending events (declines, cancellations, drafts)
    pub count: u32,
    /// For ratio checks, the events the ratio is taken over
    pub total: Option<u32>,
    pub ratio: Option<f64>,
    pub last_event_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub flags: Vec<GuardrailFlag>,
}

impl GuardrailReport {
    pub fn flags_for(&self, entity: FlaggedEntity) -> impl Iterator<Item = &GuardrailFlag> {
        self.flags.iter().filter(move |f| f.entity == entity)
    }
}

/// The slice of history a report is computed from.
#[derive(Debug, Clone, Default)]
pub struct GuardrailHistory {
    /// Invitations answered within the period
    pub responded_invitations: Vec<AnyInvitation>,
    pub status_changes: Vec<BookingStatusChange>,
    /// Bookings created within the period, in their current state
    pub bookings_created: Vec<BookingRequest>,
}

impl GuardrailHistory {
    pub async fn load<S: Storage + ?Sized>(storage: &S, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            responded_invitations: storage.invitations_responded_between(from, to).await?,
            status_changes: storage.status_changes_between(from, to).await?,
            bookings_created: storage.bookings_created_between(from, to).await?,
        })
    }
}

/// Running tally per entity.
#[derive(Debug, Clone, Copy)]
struct Tally {
    count: u32,
    total: u32,
    last_event_at: Option<DateTime<Utc>>,
}

impl Tally {
    fn new() -> Self {
        Self {
            count: 0,
            total: 0,
            last_event_at: None,
        }
    }

    fn record(&mut self, offending: bool, at: DateTime<Utc>) {
        self.total += 1;
        if offending {
            self.count += 1;
            self.last_event_at = Some(self.last_event_at.map_or(at, |last| last.max(at)));
        }
    }
}

fn tally_by<K: Eq + Hash, I>(events: I) -> HashMap<K, Tally>
where
    I: IntoIterator<Item = (K, bool, DateTime<Utc>)>,
{
    let mut tallies: HashMap<K, Tally> = HashMap::new();
    for (key, offending, at) in events {
        tallies.entry(key).or_insert_with(Tally::new).record(offending, at);
    }
    tallies
}

/// Compute the guardrail report for `[from, to)` from `history`.
///
/// Events outside the period are ignored, so callers may pass a superset.
pub fn evaluate(
    history: &GuardrailHistory,
    thresholds: &GuardrailThresholds,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    now: DateTime<Utc>,
) -> GuardrailReport {
    let in_period = |at: DateTime<Utc>| from <= at && at < to;
    let mut flags = Vec::new();

    // Decline rate counts only answers given by the provider: acceptances and their own declines
    let responses = history.responded_invitations.iter().filter_map(|invitation| {
        let at = invitation.responded_at().filter(|at| in_period(*at))?;
        match invitation.status() {
            InvitationStatus::Accepted => Some((invitation.data().provider_id, false, at)),
            InvitationStatus::Declined if invitation.is_provider_decline() => Some((invitation.data().provider_id, true, at)),
            _ => None,
        }
    });
    for (provider_id, tally) in tally_by(responses) {
        if tally.total < thresholds.provider_min_responses {
            continue;
        }
        let ratio = f64::from(tally.count) / f64::from(tally.total);
        if let Some(last_event_at) = tally.last_event_at
            && ratio >= thresholds.provider_decline_ratio
        {
            flags.push(GuardrailFlag {
                kind: GuardrailKind::ProviderDeclineRate,
                entity: FlaggedEntity::Provider(provider_id),
                count: tally.count,
                total: Some(tally.total),
                ratio: Some(ratio),
                last_event_at,
            });
        }
    }

    let cancellations: Vec<&BookingStatusChange> = history
        .status_changes
        .iter()
        .filter(|c| in_period(c.changed_at) && c.is_post_confirmation_cancellation())
        .collect();

    let by_provider = cancellations
        .iter()
        .filter(|c| c.actor == StatusActor::Provider)
        .filter_map(|c| c.provider_id.map(|p| (p, true, c.changed_at)));
    flags.extend(count_flags(
        tally_by(by_provider),
        thresholds.provider_cancellations,
        GuardrailKind::ProviderCancellations,
        FlaggedEntity::Provider,
    ));

    let by_client = cancellations
        .iter()
        .filter(|c| c.actor == StatusActor::Client)
        .map(|c| (c.client_id, true, c.changed_at));
    flags.extend(count_flags(
        tally_by(by_client),
        thresholds.client_cancellations,
        GuardrailKind::ClientCancellations,
        FlaggedEntity::Client,
    ));

    let drafts = history
        .bookings_created
        .iter()
        .filter(|b| in_period(b.created_at) && b.status == BookingStatus::Draft)
        .map(|b| (b.client_id, true, b.created_at));
    flags.extend(count_flags(
        tally_by(drafts),
        thresholds.client_draft_bookings,
        GuardrailKind::ClientDraftSpam,
        FlaggedEntity::Client,
    ));

    flags.sort_by(|a, b| a.kind.cmp(&b.kind).then(b.count.cmp(&a.count)).then(a.entity.cmp(&b.entity)));

    GuardrailReport {
        from,
        to,
        generated_at: now,
        flags,
    }
}

fn count_flags<K>(
    tallies: HashMap<K, Tally>,
    threshold: u32,
    kind: GuardrailKind,
    entity: fn(K) -> FlaggedEntity,
) -> impl Iterator<Item = GuardrailFlag> {
    tallies.into_iter().filter_map(move |(key, tally)| {
        let last_event_at = tally.last_event_at?;
        (tally.count >= threshold).then(|| GuardrailFlag {
            kind,
            entity: entity(key),
            count: tally.count,
            total: None,
            ratio: None,
            last_event_at,
        })
    })
}

/// Keeps the most recent guardrail report for operator reads.
pub struct GuardrailMonitor {
    thresholds: GuardrailThresholds,
    latest: ArcSwapOption<GuardrailReport>,
}

impl GuardrailMonitor {
    pub fn new(thresholds: GuardrailThresholds) -> Self {
        Self {
            thresholds,
            latest: ArcSwapOption::empty(),
        }
    }

    pub fn thresholds(&self) -> &GuardrailThresholds {
        &self.thresholds
    }

    pub fn latest(&self) -> Option<Arc<GuardrailReport>> {
        self.latest.load_full()
    }

    /// Compute a report for `[from, to)` without caching it.
    pub async fn report<S: Storage + ?Sized>(
        &self,
        storage: &S,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<GuardrailReport> {
        if from >= to {
            return Err(Error::Validation {
                message: format!("reporting period start ({from}) must be before end ({to})"),
            });
        }
        let history = GuardrailHistory::load(storage, from, to).await?;
        Ok(evaluate(&history, &self.thresholds, from, to, now))
    }

    /// Recompute the report over the trailing `period` and keep it as the latest.
    #[tracing::instrument(skip(self, storage))]
    pub async fn refresh<S: Storage + ?Sized>(
        &self,
        storage: &S,
        period: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Arc<GuardrailReport>> {
        let report = Arc::new(self.report(storage, now - period, now, now).await?);
        for flag in &report.flags {
            tracing::warn!(
                kind = ?flag.kind,
                entity = ?flag.entity,
                count = flag.count,
                ratio = flag.ratio,
                "Guardrail flagged"
            );
        }
        metrics::gauge!("smartmatch_guardrail_flags").set(report.flags.len() as f64);
        self.latest.store(Some(Arc::clone(&report)));
        Ok(report)
    }
}

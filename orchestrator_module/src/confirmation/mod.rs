//! Confirmation state machine for proposed calendar items.
//!
//! The local store is the source of truth. When the user has calendar sync
//! enabled and an authenticated client is available, confirmations are
//! mirrored into the external calendar first and only committed locally once
//! the external call succeeded.

mod transitions;

pub use transitions::{is_allowed, Transition};

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calendar_client::{CalendarError, EventPayload, ExternalCalendarClient};
use crate::clients::IntegrationClients;
use crate::store::{
    ActionType, AssistantStore, CalendarItem, ItemDraft, ItemKind, ItemSource, ItemStatus,
    StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {transition} an item that is {from}")]
    InvalidTransition {
        from: ItemStatus,
        transition: Transition,
    },
    #[error("calendar item {0} not found")]
    NotFound(Uuid),
    #[error("external calendar error: {0}")]
    External(#[from] CalendarError),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        TransitionError::Store(err)
    }
}

#[derive(Clone)]
pub struct ConfirmationService {
    store: AssistantStore,
    clients: Arc<dyn IntegrationClients>,
}

impl ConfirmationService {
    pub fn new(store: AssistantStore, clients: Arc<dyn IntegrationClients>) -> Self {
        Self { store, clients }
    }

    pub fn confirm(&self, user_id: &str, item_id: &Uuid) -> Result<CalendarItem, TransitionError> {
        let item = self.load_owned(user_id, item_id)?;
        ensure_allowed(&item, Transition::Confirm)?;

        let Some(client) = self.sync_client(user_id)? else {
            let target = match item.action_type {
                ActionType::Delete => ItemStatus::Deleted,
                ActionType::Create | ActionType::Update => ItemStatus::Confirmed,
            };
            debug!("confirming item {} locally for user {}", item.id, user_id);
            return self.commit(&item, target, None);
        };

        let payload = EventPayload::from_item(&item);
        match item.action_type {
            ActionType::Create => {
                let external_id = client.create_item(&payload)?;
                match self.commit(&item, ItemStatus::Confirmed, Some(&external_id)) {
                    Ok(updated) => {
                        info!(
                            "created external event {} for item {} of user {}",
                            external_id, item.id, user_id
                        );
                        Ok(updated)
                    }
                    Err(err) => {
                        // Undo the external create so neither side changed.
                        if let Err(delete_err) = client.delete_item(&external_id) {
                            error!(
                                "failed to roll back external event {} for item {}: {}",
                                external_id, item.id, delete_err
                            );
                        }
                        Err(err)
                    }
                }
            }
            ActionType::Update => match item.effective_external_id() {
                None => self.commit(&item, ItemStatus::Confirmed, None),
                Some(external_id) => {
                    client.update_item(external_id, &payload)?;
                    self.commit(&item, ItemStatus::Synced, Some(external_id))
                }
            },
            ActionType::Delete => match item.effective_external_id() {
                None => self.commit(&item, ItemStatus::Deleted, None),
                Some(external_id) => {
                    client.delete_item(external_id)?;
                    self.commit(&item, ItemStatus::Deleted, None)
                }
            },
        }
    }

    pub fn reject(&self, user_id: &str, item_id: &Uuid) -> Result<CalendarItem, TransitionError> {
        let item = self.load_owned(user_id, item_id)?;
        ensure_allowed(&item, Transition::Reject)?;
        self.commit(&item, ItemStatus::Rejected, None)
    }

    pub fn complete(&self, user_id: &str, item_id: &Uuid) -> Result<CalendarItem, TransitionError> {
        let item = self.load_owned(user_id, item_id)?;
        ensure_allowed(&item, Transition::Complete)?;
        self.commit(&item, ItemStatus::Completed, None)
    }

    /// Dismiss locally; the external copy is deleted on a best-effort basis
    /// whenever an authenticated client exists.
    pub fn dismiss(&self, user_id: &str, item_id: &Uuid) -> Result<CalendarItem, TransitionError> {
        let item = self.load_owned(user_id, item_id)?;
        ensure_allowed(&item, Transition::Dismiss)?;

        // An event mirrored earlier is removed even if sync was turned off since.
        if let Some(external_id) = item.external_id.as_deref() {
            if let Some(client) = self.authenticated_client(user_id) {
                if let Err(err) = client.delete_item(external_id) {
                    warn!(
                        "external delete of {} failed while dismissing item {} for user {}: {}",
                        external_id, item.id, user_id, err
                    );
                }
            }
        }
        self.commit(&item, ItemStatus::Dismissed, None)
    }

    /// Dismiss an item whose external copy was cancelled outside the app.
    pub fn dismiss_from_external(&self, item_id: &Uuid) -> Result<CalendarItem, TransitionError> {
        let item = self.load(item_id)?;
        ensure_allowed(&item, Transition::Dismiss)?;
        self.commit(&item, ItemStatus::Dismissed, None)
    }

    /// Store a reminder the user entered directly. It skips the pending state.
    pub fn create_manual_reminder(
        &self,
        user_id: &str,
        draft: &ItemDraft,
    ) -> Result<CalendarItem, TransitionError> {
        let mut draft = draft.clone();
        draft.kind = ItemKind::Reminder;
        draft.action_type = ActionType::Create;
        let item = self.store.insert_item(
            user_id,
            &draft,
            ItemStatus::Confirmed,
            ItemSource::Manual,
            None,
        )?;
        info!("created reminder {} for user {}", item.id, user_id);
        Ok(item)
    }

    fn load(&self, item_id: &Uuid) -> Result<CalendarItem, TransitionError> {
        match self.store.get_item(item_id) {
            Ok(item) => Ok(item),
            Err(StoreError::NotFound(_)) => Err(TransitionError::NotFound(*item_id)),
            Err(err) => Err(err.into()),
        }
    }

    fn load_owned(&self, user_id: &str, item_id: &Uuid) -> Result<CalendarItem, TransitionError> {
        let item = self.load(item_id)?;
        if item.user_id != user_id {
            return Err(TransitionError::NotFound(*item_id));
        }
        Ok(item)
    }

    /// The user's calendar client, or `None` when the transition must stay local.
    fn sync_client(
        &self,
        user_id: &str,
    ) -> Result<Option<Arc<dyn ExternalCalendarClient>>, TransitionError> {
        if !self.store.calendar_sync_enabled(user_id)? {
            return Ok(None);
        }
        Ok(self.authenticated_client(user_id))
    }

    fn authenticated_client(&self, user_id: &str) -> Option<Arc<dyn ExternalCalendarClient>> {
        match self.clients.calendar_client(user_id) {
            Ok(client) if client.is_authenticated() => Some(client),
            Ok(_) => {
                debug!("calendar client for user {} is not authenticated", user_id);
                None
            }
            Err(err) => {
                debug!("no calendar client for user {}: {}", user_id, err);
                None
            }
        }
    }

    /// Compare-and-set from the status the item was loaded with.
    fn commit(
        &self,
        item: &CalendarItem,
        to: ItemStatus,
        external_id: Option<&str>,
    ) -> Result<CalendarItem, TransitionError> {
        if self
            .store
            .transition_item(&item.id, item.status, to, external_id)?
        {
            return Ok(self.store.get_item(&item.id)?);
        }
        // Someone else moved the item since it was loaded.
        let current = self.load(&item.id)?;
        Err(TransitionError::InvalidTransition {
            from: current.status,
            transition: transition_for(to),
        })
    }
}

fn ensure_allowed(item: &CalendarItem, transition: Transition) -> Result<(), TransitionError> {
    if is_allowed(item.status, transition) {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition {
            from: item.status,
            transition,
        })
    }
}

fn transition_for(target: ItemStatus) -> Transition {
    match target {
        ItemStatus::Rejected => Transition::Reject,
        ItemStatus::Completed => Transition::Complete,
        ItemStatus::Dismissed => Transition::Dismiss,
        _ => Transition::Confirm,
    }
}

use crate::cipher;
use crate::group::epoch::{message_key, GroupKeyEpoch};
use crate::group::{GroupMessage, GroupSenderKeyState};
use crate::proto::{EpochStateProto, GroupChannelProto};
use crate::store::Persist;
use crate::types::DeviceId;
use crate::Error;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

const GROUP_MESSAGE_INFO: &[u8] = b"Hushwire-Group-Message";
const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug)]
struct EpochState {
    epoch: GroupKeyEpoch,
    senders: HashMap<String, GroupSenderKeyState>,
}

impl EpochState {
    fn new(epoch: GroupKeyEpoch) -> Self {
        Self {
            epoch,
            senders: HashMap::new(),
        }
    }

    fn sender(&mut self, sender_id: &str) -> &mut GroupSenderKeyState {
        self.senders
            .entry(sender_id.to_string())
            .or_insert_with(|| GroupSenderKeyState::new(sender_id))
    }
}

/// Sender-key state of one (group, channel) as seen by the local device.
///
/// Holds the current member set, the current epoch and up to
/// `retained_epochs` superseded epochs for messages still in flight. Every
/// membership change produces a new epoch; there is no way to change the
/// members without rekeying. A message is accepted only from a device that is
/// both a current member and a member of the epoch it was sent under.
#[derive(Clone, Debug)]
pub struct GroupChannel {
    group_id: String,
    channel_id: String,
    members: BTreeSet<DeviceId>,
    current_version: Option<u64>,
    epochs: BTreeMap<u64, EpochState>,
    retained_epochs: usize,
}

impl GroupChannel {
    pub fn new(
        group_id: &str,
        channel_id: &str,
        members: impl IntoIterator<Item = DeviceId>,
        retained_epochs: usize,
    ) -> Self {
        Self {
            group_id: group_id.to_string(),
            channel_id: channel_id.to_string(),
            members: members.into_iter().collect(),
            current_version: None,
            epochs: BTreeMap::new(),
            retained_epochs,
        }
    }

    /// Store key of a channel.
    pub fn storage_key(group_id: &str, channel_id: &str) -> String {
        format!("{group_id}/{channel_id}")
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn is_member(&self, device: &str) -> bool {
        self.members.contains(device)
    }

    pub fn current_version(&self) -> Option<u64> {
        self.current_version
    }

    /// Epoch versions held, oldest first.
    pub fn epoch_versions(&self) -> Vec<u64> {
        self.epochs.keys().copied().collect()
    }

    pub fn current_epoch(&self) -> Option<&GroupKeyEpoch> {
        self.current_version
            .and_then(|version| self.epochs.get(&version))
            .map(|state| &state.epoch)
    }

    pub fn sender_state(&self, version: u64, sender_id: &str) -> Option<&GroupSenderKeyState> {
        self.epochs.get(&version)?.senders.get(sender_id)
    }

    /// Creates and installs a new epoch. The returned epoch must be
    /// distributed to every current member.
    pub fn create_epoch(&mut self) -> Result<GroupKeyEpoch, Error> {
        let version = self
            .epochs
            .keys()
            .next_back()
            .copied()
            .max(self.current_version)
            .map_or(Ok(1), |latest| {
                latest
                    .checked_add(1)
                    .ok_or_else(|| Error::Protocol("epoch version exhausted".to_string()))
            })?;

        let epoch = GroupKeyEpoch::generate(
            &self.group_id,
            &self.channel_id,
            version,
            self.members.iter().cloned(),
        )?;
        self.epochs.insert(version, EpochState::new(epoch.clone()));
        self.current_version = Some(version);
        self.prune();

        info!(
            group_id = %self.group_id,
            channel_id = %self.channel_id,
            version,
            members = self.members.len(),
            "group epoch created"
        );
        Ok(epoch)
    }

    /// Replaces the member set and rekeys.
    pub fn set_members(
        &mut self,
        members: impl IntoIterator<Item = DeviceId>,
    ) -> Result<GroupKeyEpoch, Error> {
        self.members = members.into_iter().collect();
        self.create_epoch()
    }

    /// Adds a member and rekeys, so the newcomer cannot read history.
    pub fn add_member(&mut self, device: &str) -> Result<GroupKeyEpoch, Error> {
        self.members.insert(device.to_string());
        self.create_epoch()
    }

    /// Removes a member and rekeys, so the removed device cannot read
    /// anything sent afterwards.
    pub fn remove_member(&mut self, device: &str) -> Result<GroupKeyEpoch, Error> {
        self.members.remove(device);
        self.create_epoch()
    }

    /// Installs an epoch received through distribution.
    ///
    /// Returns false for a version already held with the same key. The same
    /// version with a different key or member set is a conflicting rotation
    /// and fails with [`Error::Protocol`]. A newer version becomes current and
    /// its member set replaces the channel's.
    pub fn accept_epoch(&mut self, epoch: GroupKeyEpoch) -> Result<bool, Error> {
        if epoch.group_id() != self.group_id || epoch.channel_id() != self.channel_id {
            return Err(Error::Protocol(format!(
                "epoch for {}/{} offered to {}/{}",
                epoch.group_id(),
                epoch.channel_id(),
                self.group_id,
                self.channel_id
            )));
        }

        let version = epoch.version();
        if let Some(held) = self.epochs.get(&version) {
            if held.epoch.matches(&epoch) {
                debug!(group_id = %self.group_id, version, "epoch already known");
                return Ok(false);
            }
            warn!(
                group_id = %self.group_id,
                channel_id = %self.channel_id,
                version,
                "conflicting key offered for a held epoch"
            );
            return Err(Error::Protocol(format!(
                "conflicting key for epoch {version} of {}/{}",
                self.group_id, self.channel_id
            )));
        }

        if self.current_version.is_none_or(|current| version > current) {
            self.members = epoch.members().clone();
            self.current_version = Some(version);
        }
        self.epochs.insert(version, EpochState::new(epoch));
        self.prune();

        debug!(
            group_id = %self.group_id,
            channel_id = %self.channel_id,
            version,
            "group epoch accepted"
        );
        Ok(true)
    }

    /// A held epoch by version, current or retained.
    pub fn epoch(&self, version: u64) -> Option<&GroupKeyEpoch> {
        self.epochs.get(&version).map(|state| &state.epoch)
    }

    /// Drops an epoch explicitly. The current epoch cannot be dropped.
    pub fn discard_epoch(&mut self, version: u64) -> bool {
        if self.current_version == Some(version) {
            return false;
        }
        self.epochs.remove(&version).is_some()
    }

    /// Encrypts as `sender_id` under the current epoch and advances that
    /// sender's own index.
    pub fn encrypt(&mut self, sender_id: &str, plaintext: &[u8]) -> Result<GroupMessage, Error> {
        let version = self.current_version.ok_or_else(|| {
            Error::Protocol(format!(
                "no epoch for {}/{}",
                self.group_id, self.channel_id
            ))
        })?;
        let state = self
            .epochs
            .get_mut(&version)
            .ok_or_else(|| Error::Protocol("current epoch missing".to_string()))?;
        if !state.epoch.is_member(sender_id) {
            return Err(not_a_sender(sender_id, &state.epoch));
        }

        let sender_key = state.epoch.sender_key(sender_id)?;
        let sender = state.sender(sender_id);
        let mut next = sender.clone();
        let index = next.advance()?;
        let message_key = message_key(&sender_key, index)?;

        let mut message = GroupMessage {
            group_id: self.group_id.clone(),
            channel_id: self.channel_id.clone(),
            epoch_version: version,
            sender_id: sender_id.to_string(),
            index,
            ciphertext: Vec::new(),
        };
        message.ciphertext = cipher::seal(&message_key, GROUP_MESSAGE_INFO, plaintext, &message.aad()?)?;
        *sender = next;

        Ok(message)
    }

    /// Decrypts a message from a member. Only the receiver-side replay window
    /// of that sender is updated, and only on success.
    ///
    /// A device removed from the channel is refused even under an epoch it
    /// still holds.
    pub fn decrypt(&mut self, message: &GroupMessage) -> Result<Vec<u8>, Error> {
        let current_member = self.members.contains(&message.sender_id);
        let state = self
            .epochs
            .get_mut(&message.epoch_version)
            .ok_or_else(|| Error::EpochUnknown {
                group_id: message.group_id.clone(),
                channel_id: message.channel_id.clone(),
                version: message.epoch_version,
            })?;
        if !current_member || !state.epoch.is_member(&message.sender_id) {
            return Err(not_a_sender(&message.sender_id, &state.epoch));
        }

        let sender_key = state.epoch.sender_key(&message.sender_id)?;
        let sender = state.sender(&message.sender_id);
        sender.check_fresh(message.index)?;

        let message_key = message_key(&sender_key, message.index)?;
        let plaintext = cipher::open(&message_key, GROUP_MESSAGE_INFO, &message.ciphertext, &message.aad()?)?;
        sender.mark_seen(message.index);

        Ok(plaintext)
    }

    fn prune(&mut self) {
        let keep = self.retained_epochs.saturating_add(1);
        while self.epochs.len() > keep {
            let Some((&oldest, _)) = self.epochs.iter().next() else {
                break;
            };
            if Some(oldest) == self.current_version {
                break;
            }
            self.epochs.remove(&oldest);
            debug!(group_id = %self.group_id, version = oldest, "group epoch discarded");
        }
    }
}

fn not_a_sender(device: &str, epoch: &GroupKeyEpoch) -> Error {
    Error::Protocol(format!(
        "{device} may not send in {}/{} epoch {}",
        epoch.group_id(),
        epoch.channel_id(),
        epoch.version()
    ))
}

impl Persist for GroupChannel {
    type Record = GroupChannelProto;

    fn to_record(&self) -> GroupChannelProto {
        GroupChannelProto {
            version: SCHEMA_VERSION,
            group_id: self.group_id.clone(),
            channel_id: self.channel_id.clone(),
            members: self.members.iter().cloned().collect(),
            current_version: self.current_version,
            epochs: self
                .epochs
                .values()
                .map(|state| EpochStateProto {
                    epoch: Some(state.epoch.to_proto()),
                    senders: state.senders.values().map(GroupSenderKeyState::to_proto).collect(),
                })
                .collect(),
            retained_epochs: u32::try_from(self.retained_epochs).unwrap_or(u32::MAX),
        }
    }

    fn from_record(record: GroupChannelProto) -> Result<Self, Error> {
        if record.version != SCHEMA_VERSION {
            return Err(Error::Serde(format!(
                "unsupported group channel version {}",
                record.version
            )));
        }

        let mut epochs = BTreeMap::new();
        for state in &record.epochs {
            let epoch = state
                .epoch
                .as_ref()
                .ok_or_else(|| Error::Serde("epoch state without key".to_string()))?;
            let epoch = GroupKeyEpoch::from_proto(epoch)?;
            let senders = state
                .senders
                .iter()
                .map(|sender| (sender.sender_id.clone(), GroupSenderKeyState::from_proto(sender)))
                .collect();
            epochs.insert(epoch.version(), EpochState { epoch, senders });
        }

        Ok(Self {
            group_id: record.group_id,
            channel_id: record.channel_id,
            members: record.members.into_iter().collect(),
            current_version: record.current_version,
            epochs,
            retained_epochs: record.retained_epochs as usize,
        })
    }
}

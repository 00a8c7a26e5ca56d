//! Device-level facade tying keys, sessions, groups and the outbound queue
//! together.
//!
//! A [`Messenger`] owns one local device. All session and group mutations go
//! through [`TransactionalStore::transact`], so two tasks working on the same
//! peer or channel are serialized while unrelated peers proceed in parallel.

use crate::config::Config;
use crate::directory::KeyDirectory;
use crate::envelope::{Destination, Envelope, Payload};
use crate::fanout::{DeliveryStatus, FanoutCoordinator, QueueEntry, QueueReport, Transport};
use crate::group::{
    distribute_epoch, receive_distribution, EpochRequest, GroupChannel, GroupKeyEpoch,
    GroupMessage, PairwiseChannel, SenderKeyDistributionMessage,
};
use crate::keys::{IdentityPublicKey, KeyManager};
use crate::session::{PinnedIdentity, PreKeyMessage, Session, SessionCiphertext, SessionRecord};
use crate::store::{KeyValueStore, TransactionalStore};
use crate::types::{generate_message_id, now, DeviceId};
use crate::x3dh::{
    establish_as_initiator, establish_as_responder, preview_responder_session, X3DH,
};
use crate::Error;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Group messages held back while their epoch is requested.
const MAX_PARKED_GROUP_MESSAGES: usize = 256;

/// What an inbound envelope turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Direct {
        sender: DeviceId,
        plaintext: Vec<u8>,
    },
    Group {
        sender: DeviceId,
        group_id: String,
        channel_id: String,
        plaintext: Vec<u8>,
    },
    /// A group epoch was installed. `released` holds the group messages
    /// that were waiting for it.
    EpochInstalled {
        sender: DeviceId,
        group_id: String,
        channel_id: String,
        version: u64,
        released: Vec<Received>,
    },
    /// A member asked for an epoch again and it was queued for them.
    EpochResent {
        requester: DeviceId,
        group_id: String,
        channel_id: String,
        version: u64,
    },
}

pub struct Messenger<S, D, T> {
    device_id: DeviceId,
    config: Config,
    x3dh: X3DH,
    store: Arc<S>,
    keys: KeyManager<S>,
    sessions: TransactionalStore<S, SessionRecord>,
    identities: TransactionalStore<S, PinnedIdentity>,
    groups: TransactionalStore<S, GroupChannel>,
    directory: Arc<D>,
    queue: FanoutCoordinator<T>,
    /// Serializes handshakes so concurrent sends or pre-key messages for the
    /// same peer settle on one session.
    handshake: Mutex<()>,
    /// Group messages received before their epoch, oldest first.
    parked: Mutex<Vec<GroupMessage>>,
}

impl<S: KeyValueStore, D: KeyDirectory, T: Transport> Messenger<S, D, T> {
    /// Loads the device state from `store`, creating identity and pre-keys on
    /// first use, and publishes the bundle.
    pub async fn open(
        device_id: &str,
        store: Arc<S>,
        directory: Arc<D>,
        transport: Arc<T>,
        config: Config,
    ) -> Result<Self, Error> {
        let keys = KeyManager::open(store.clone(), config.clone()).await?;
        if !keys.has_identity().await {
            keys.generate_identity().await?;
            info!(device_id, "new device identity created");
        }

        let messenger = Self {
            device_id: device_id.to_string(),
            x3dh: X3DH::new(&config.protocol_info),
            sessions: TransactionalStore::new(store.clone(), "sessions"),
            identities: TransactionalStore::new(store.clone(), "identities"),
            groups: TransactionalStore::new(store.clone(), "groups"),
            queue: FanoutCoordinator::new(transport, &config),
            handshake: Mutex::new(()),
            parked: Mutex::new(Vec::new()),
            keys,
            store,
            directory,
            config,
        };
        messenger.maintain_keys().await?;
        Ok(messenger)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn keys(&self) -> &KeyManager<S> {
        &self.keys
    }

    pub async fn identity(&self) -> Result<IdentityPublicKey, Error> {
        self.keys.identity_public().await
    }

    /// Rotates a due signed pre-key, purges expired ones, tops up the
    /// one-time pool and republishes. Meant to run periodically.
    pub async fn maintain_keys(&self) -> Result<(), Error> {
        let now = now();
        if self.keys.signed_pre_key_due(now).await {
            self.keys.generate_signed_pre_key(now).await?;
        }
        self.keys.purge_expired_signed_pre_keys(now).await?;
        self.publish_keys().await
    }

    /// Forces a signed pre-key rotation and republishes.
    pub async fn rotate_signed_pre_key(&self) -> Result<(), Error> {
        self.keys.rotate_signed_pre_key(now()).await?;
        self.publish_keys().await
    }

    pub async fn publish_keys(&self) -> Result<(), Error> {
        self.keys.replenish_one_time_pre_keys().await?;
        let bundle = self.keys.published_bundle().await?;
        self.directory.publish(&self.device_id, &bundle).await
    }

    pub async fn has_session(&self, remote_device: &str) -> Result<bool, Error> {
        Ok(self.sessions.get(&self.session_key(remote_device)).await?.is_some())
    }

    /// Runs the initiator handshake with `remote_device`.
    ///
    /// Returns false when a session already exists; it is kept as is. A
    /// changed identity key fails with [`Error::IdentityKeyChanged`] and is
    /// held for [`Self::approve_identity`].
    pub async fn establish_session(&self, remote_device: &str) -> Result<bool, Error> {
        if self.has_session(remote_device).await? {
            return Ok(false);
        }
        let _handshake = self.handshake.lock().await;
        if self.has_session(remote_device).await? {
            return Ok(false);
        }

        let mut bundle = self.directory.fetch(remote_device).await?;
        self.check_identity(remote_device, &bundle.identity()).await?;

        let identity = self.keys.identity().await?;
        let (session, header) = establish_as_initiator(
            &self.x3dh,
            &identity,
            &self.device_id,
            remote_device,
            &mut bundle,
            self.config.max_skipped_messages,
            now(),
        )?;

        let created = self
            .sessions
            .transact(&self.session_key(remote_device), move |slot| {
                if slot.is_some() {
                    return Ok(false);
                }
                *slot = Some(SessionRecord::new(session));
                Ok(true)
            })
            .await?;

        if let Some(id) = header.one_time_pre_key_id {
            self.directory.mark_consumed(remote_device, id).await?;
        }
        Ok(created)
    }

    /// Drops every session with `remote_device`. The next send runs a fresh handshake.
    pub async fn reset_session(&self, remote_device: &str) -> Result<(), Error> {
        self.sessions.delete(&self.session_key(remote_device)).await?;
        info!(remote_device, "session reset");
        Ok(())
    }

    /// Trusts the changed identity key reported for `remote_device`.
    ///
    /// Returns false when no change was pending. A change is only ever held
    /// after the peer proved possession of the new key, either through a
    /// signed bundle or an authenticated pre-key message. The existing session
    /// is superseded once the peer's new handshake arrives.
    pub async fn approve_identity(&self, remote_device: &str) -> Result<bool, Error> {
        let approved = self
            .identities
            .transact(remote_device, |slot| {
                Ok(slot.as_mut().is_some_and(PinnedIdentity::approve))
            })
            .await?;
        if approved {
            info!(remote_device, "changed identity key approved");
        }
        Ok(approved)
    }

    /// Fingerprint of the pinned identity of `remote_device`, if any.
    pub async fn fingerprint(&self, remote_device: &str) -> Result<Option<String>, Error> {
        Ok(self
            .identities
            .get(remote_device)
            .await?
            .map(|pin| pin.trusted.fingerprint()))
    }

    /// Encrypts `plaintext` for one device, running the handshake when needed.
    pub async fn encrypt_direct(
        &self,
        remote_device: &str,
        plaintext: &[u8],
    ) -> Result<Envelope, Error> {
        let ciphertext = self.encrypt_session(remote_device, plaintext).await?;
        Envelope::new(
            &self.device_id,
            Destination::Device(remote_device.to_string()),
            ciphertext.into(),
            now(),
        )
    }

    /// Decrypts a pairwise envelope addressed to this device.
    pub async fn decrypt_direct(&self, envelope: &Envelope) -> Result<Vec<u8>, Error> {
        self.check_addressed_to_me(envelope)?;
        let ciphertext = match &envelope.payload {
            Payload::PreKey(message) => SessionCiphertext::PreKey(message.clone()),
            Payload::Ratchet(message) => SessionCiphertext::Ratchet(message.clone()),
            other => {
                return Err(Error::Protocol(format!(
                    "{} payload is not a pairwise message",
                    other.kind()
                )))
            }
        };
        self.decrypt_session(&envelope.sender_id, &ciphertext).await
    }

    /// Creates a channel with this device and `members`, and queues the first
    /// epoch key for every other member.
    pub async fn create_group(
        &self,
        group_id: &str,
        channel_id: &str,
        members: impl IntoIterator<Item = DeviceId>,
    ) -> Result<QueueEntry, Error> {
        let mut members: Vec<DeviceId> = members.into_iter().collect();
        members.push(self.device_id.clone());
        let retained = self.config.retained_group_epochs;

        let (epoch, members) = self
            .groups
            .transact(&GroupChannel::storage_key(group_id, channel_id), move |slot| {
                if slot.is_some() {
                    return Err(Error::Protocol(format!(
                        "group {group_id}/{channel_id} already exists"
                    )));
                }
                let mut channel = GroupChannel::new(group_id, channel_id, members, retained);
                let epoch = channel.create_epoch()?;
                let members = channel.members().map(str::to_string).collect::<Vec<_>>();
                *slot = Some(channel);
                Ok((epoch, members))
            })
            .await?;
        self.distribute(&epoch, members).await
    }

    /// Starts a new epoch with the same members.
    pub async fn rotate_group_key(
        &self,
        group_id: &str,
        channel_id: &str,
    ) -> Result<QueueEntry, Error> {
        self.rekey_group(group_id, channel_id, |channel| channel.create_epoch())
            .await
    }

    pub async fn add_group_member(
        &self,
        group_id: &str,
        channel_id: &str,
        device: &str,
    ) -> Result<QueueEntry, Error> {
        self.rekey_group(group_id, channel_id, |channel| channel.add_member(device))
            .await
    }

    pub async fn remove_group_member(
        &self,
        group_id: &str,
        channel_id: &str,
        device: &str,
    ) -> Result<QueueEntry, Error> {
        self.rekey_group(group_id, channel_id, |channel| channel.remove_member(device))
            .await
    }

    /// Replaces the member set in a single rekey. This device stays a member.
    pub async fn set_group_members(
        &self,
        group_id: &str,
        channel_id: &str,
        members: impl IntoIterator<Item = DeviceId>,
    ) -> Result<QueueEntry, Error> {
        let mut members: Vec<DeviceId> = members.into_iter().collect();
        members.push(self.device_id.clone());
        self.rekey_group(group_id, channel_id, move |channel| channel.set_members(members))
            .await
    }

    /// Encrypts once for the whole channel under the current epoch.
    pub async fn encrypt_group(
        &self,
        group_id: &str,
        channel_id: &str,
        plaintext: &[u8],
    ) -> Result<Envelope, Error> {
        let device_id = self.device_id.as_str();
        let message = self
            .groups
            .transact(&GroupChannel::storage_key(group_id, channel_id), |slot| {
                slot.as_mut()
                    .ok_or_else(|| unknown_channel(group_id, channel_id))?
                    .encrypt(device_id, plaintext)
            })
            .await?;

        Envelope::new(
            &self.device_id,
            Destination::Group {
                group_id: group_id.to_string(),
                channel_id: channel_id.to_string(),
            },
            Payload::Group(message),
            now(),
        )
    }

    pub async fn decrypt_group(&self, message: &GroupMessage) -> Result<Vec<u8>, Error> {
        self.groups
            .transact(
                &GroupChannel::storage_key(&message.group_id, &message.channel_id),
                |slot| match slot.as_mut() {
                    Some(channel) => channel.decrypt(message),
                    None => Err(Error::EpochUnknown {
                        group_id: message.group_id.clone(),
                        channel_id: message.channel_id.clone(),
                        version: message.epoch_version,
                    }),
                },
            )
            .await
    }

    /// Unwraps and installs an epoch key sent by `sender_device`.
    ///
    /// The epoch names its own member set, which becomes the channel's when
    /// the epoch is the newest. The sender must be a member of the epoch and,
    /// for a channel already known, a current member. Returns false when the
    /// epoch was already known; a different key under a held version fails.
    pub async fn accept_distribution(
        &self,
        sender_device: &str,
        message: &SenderKeyDistributionMessage,
    ) -> Result<bool, Error> {
        let epoch = receive_distribution(message, sender_device, self).await?;
        if !epoch.is_member(sender_device) || !epoch.is_member(&self.device_id) {
            return Err(Error::Protocol(format!(
                "epoch {} of {}/{} from {sender_device} does not list both devices",
                epoch.version(),
                epoch.group_id(),
                epoch.channel_id()
            )));
        }

        let retained = self.config.retained_group_epochs;
        self.groups
            .transact(
                &GroupChannel::storage_key(&message.group_id, &message.channel_id),
                move |slot| match slot.as_mut() {
                    Some(channel) if !channel.is_member(sender_device) => {
                        Err(Error::Protocol(format!(
                            "{sender_device} is not a member of {}/{}",
                            epoch.group_id(),
                            epoch.channel_id()
                        )))
                    }
                    Some(channel) => channel.accept_epoch(epoch),
                    None => {
                        let mut channel = GroupChannel::new(
                            epoch.group_id(),
                            epoch.channel_id(),
                            epoch.members().iter().cloned(),
                            retained,
                        );
                        let installed = channel.accept_epoch(epoch)?;
                        *slot = Some(channel);
                        Ok(installed)
                    }
                },
            )
            .await
    }

    /// Asks `member` to send epoch `version` of a channel again, for example
    /// after a group message failed with [`Error::EpochUnknown`].
    ///
    /// The request goes through the outbound queue and is retried with backoff
    /// like any other message.
    pub async fn request_epoch(
        &self,
        member: &str,
        group_id: &str,
        channel_id: &str,
        version: u64,
    ) -> Result<QueueEntry, Error> {
        let message_id = generate_message_id()?;
        let mut envelope = Envelope::new(
            &self.device_id,
            Destination::Device(member.to_string()),
            Payload::EpochRequest(EpochRequest {
                group_id: group_id.to_string(),
                channel_id: channel_id.to_string(),
                version,
            }),
            now(),
        )?;
        envelope.id = message_id.clone();
        debug!(member, group_id, channel_id, version, "epoch requested");
        self.queue
            .enqueue(message_id, vec![member.to_string()], vec![envelope])
            .await
    }

    /// Encrypts `plaintext` for every device in `recipients` and queues the
    /// envelopes under one message id.
    ///
    /// Every envelope carries the message id, which recipients echo back in
    /// their acknowledgement. Missing sessions are all established before any
    /// session advances, so a failed handshake returns an error with nothing
    /// encrypted and the call can simply be repeated.
    pub async fn enqueue_outbound(
        &self,
        recipients: &[DeviceId],
        plaintext: &[u8],
    ) -> Result<QueueEntry, Error> {
        for recipient in recipients {
            self.establish_session(recipient).await?;
        }

        let message_id = generate_message_id()?;
        let mut envelopes = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            match self.encrypt_direct(recipient, plaintext).await {
                Ok(mut envelope) => {
                    envelope.id = message_id.clone();
                    envelopes.push(envelope);
                }
                Err(err) => {
                    // The sessions already advanced must not lose their message.
                    warn!(recipient = %recipient, %err, "fan-out cut short");
                    let sealed = recipients[..envelopes.len()].to_vec();
                    if !sealed.is_empty() {
                        self.queue.enqueue(message_id, sealed, envelopes).await?;
                    }
                    return Err(err);
                }
            }
        }
        self.queue
            .enqueue(message_id, recipients.to_vec(), envelopes)
            .await
    }

    /// Queues one group envelope for every other member of the channel.
    pub async fn enqueue_group(
        &self,
        group_id: &str,
        channel_id: &str,
        plaintext: &[u8],
    ) -> Result<QueueEntry, Error> {
        let mut envelope = self.encrypt_group(group_id, channel_id, plaintext).await?;
        let message_id = generate_message_id()?;
        envelope.id = message_id.clone();

        let recipients = self
            .groups
            .get(&GroupChannel::storage_key(group_id, channel_id))
            .await?
            .map(|channel| {
                channel
                    .members()
                    .filter(|member| *member != self.device_id)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.queue
            .enqueue(message_id, recipients, vec![envelope])
            .await
    }

    pub async fn process_queue(&self) -> Result<QueueReport, Error> {
        self.queue.process_queue().await
    }

    pub async fn acknowledge(&self, message_id: &str, device: &str) -> Result<DeliveryStatus, Error> {
        self.queue.acknowledge(message_id, device).await
    }

    pub async fn delivery_status(&self, message_id: &str) -> Result<DeliveryStatus, Error> {
        self.queue.delivery_status(message_id).await
    }

    pub async fn retrigger(&self, message_id: &str) -> Result<(), Error> {
        self.queue.retrigger(message_id).await
    }

    pub async fn cancel(&self, message_id: &str) -> Result<(), Error> {
        self.queue.cancel(message_id).await
    }

    pub async fn queue_entry(&self, message_id: &str) -> Option<QueueEntry> {
        self.queue.entry(message_id).await
    }

    /// Forgets cancelled messages and sent ones whose delivery is settled.
    pub async fn purge_finished(&self) -> usize {
        self.queue.purge_finished().await
    }

    /// Dispatches an inbound envelope by payload kind.
    pub async fn receive(&self, envelope: &Envelope) -> Result<Received, Error> {
        let sender = envelope.sender_id.clone();
        match &envelope.payload {
            Payload::PreKey(_) | Payload::Ratchet(_) => {
                let plaintext = self.decrypt_direct(envelope).await?;
                Ok(Received::Direct { sender, plaintext })
            }
            Payload::Group(message) => match self.decrypt_group(message).await {
                Ok(plaintext) => Ok(group_received(message, plaintext)),
                Err(err @ Error::EpochUnknown { .. }) => {
                    self.await_epoch(message).await?;
                    Err(err)
                }
                Err(err) => Err(err),
            },
            Payload::SenderKeyDistribution(message) => {
                self.check_addressed_to_me(envelope)?;
                let installed = self.accept_distribution(&sender, message).await?;
                debug!(
                    sender = %sender,
                    group_id = %message.group_id,
                    version = message.epoch_version,
                    installed,
                    "distribution received"
                );
                let released = self
                    .release_parked(&message.group_id, &message.channel_id)
                    .await;
                Ok(Received::EpochInstalled {
                    sender,
                    group_id: message.group_id.clone(),
                    channel_id: message.channel_id.clone(),
                    version: message.epoch_version,
                    released,
                })
            }
            Payload::EpochRequest(request) => {
                self.check_addressed_to_me(envelope)?;
                self.answer_epoch_request(&sender, request).await?;
                Ok(Received::EpochResent {
                    requester: sender,
                    group_id: request.group_id.clone(),
                    channel_id: request.channel_id.clone(),
                    version: request.version,
                })
            }
        }
    }

    /// Flushes the store. Queue entries not yet sent are lost.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let pending = self
            .queue
            .entries()
            .await
            .iter()
            .filter(|entry| entry.unsent() > 0)
            .count();
        if pending > 0 {
            warn!(pending, "shutting down with unsent messages");
        }
        self.store.flush().await?;
        info!(device_id = %self.device_id, "messenger shut down");
        Ok(())
    }

    /// Parks a group message whose epoch is missing and asks its sender for
    /// the epoch, once per missing epoch.
    async fn await_epoch(&self, message: &GroupMessage) -> Result<(), Error> {
        let first = {
            let mut parked = self.parked.lock().await;
            let first = !parked.iter().any(|held| {
                held.group_id == message.group_id
                    && held.channel_id == message.channel_id
                    && held.epoch_version == message.epoch_version
            });
            if parked.len() >= MAX_PARKED_GROUP_MESSAGES {
                warn!(group_id = %message.group_id, "too many group messages waiting; dropping the oldest");
                parked.remove(0);
            }
            parked.push(message.clone());
            first
        };
        if first {
            self.request_epoch(
                &message.sender_id,
                &message.group_id,
                &message.channel_id,
                message.epoch_version,
            )
            .await?;
        }
        Ok(())
    }

    /// Retries the parked messages of a channel after an epoch arrived.
    async fn release_parked(&self, group_id: &str, channel_id: &str) -> Vec<Received> {
        let waiting: Vec<GroupMessage> = {
            let mut parked = self.parked.lock().await;
            let (waiting, rest) = std::mem::take(&mut *parked)
                .into_iter()
                .partition(|held| held.group_id == group_id && held.channel_id == channel_id);
            *parked = rest;
            waiting
        };

        let mut released = Vec::new();
        for message in waiting {
            match self.decrypt_group(&message).await {
                Ok(plaintext) => released.push(group_received(&message, plaintext)),
                Err(Error::EpochUnknown { .. }) => self.parked.lock().await.push(message),
                Err(err) => debug!(%err, group_id, "parked group message dropped"),
            }
        }
        released
    }

    /// Wraps a held epoch again for `requester`, who must be a member of both
    /// the channel and that epoch.
    async fn answer_epoch_request(
        &self,
        requester: &str,
        request: &EpochRequest,
    ) -> Result<QueueEntry, Error> {
        let channel = self
            .groups
            .get(&GroupChannel::storage_key(&request.group_id, &request.channel_id))
            .await?
            .ok_or_else(|| unknown_channel(&request.group_id, &request.channel_id))?;
        let epoch = channel
            .epoch(request.version)
            .ok_or_else(|| Error::EpochUnknown {
                group_id: request.group_id.clone(),
                channel_id: request.channel_id.clone(),
                version: request.version,
            })?
            .clone();
        if !channel.is_member(requester) || !epoch.is_member(requester) {
            warn!(requester, group_id = %request.group_id, version = request.version, "epoch request refused");
            return Err(Error::Protocol(format!(
                "{requester} may not receive epoch {} of {}/{}",
                request.version, request.group_id, request.channel_id
            )));
        }
        self.distribute(&epoch, vec![requester.to_string()]).await
    }

    fn session_key(&self, remote_device: &str) -> String {
        Session::storage_key(&self.device_id, remote_device)
    }

    fn check_addressed_to_me(&self, envelope: &Envelope) -> Result<(), Error> {
        match &envelope.destination {
            Destination::Device(device) if *device == self.device_id => Ok(()),
            other => Err(Error::Protocol(format!(
                "envelope {} addressed to {other:?}",
                envelope.id
            ))),
        }
    }

    /// Pins `seen` on first contact, otherwise compares it to the pinned key.
    async fn check_identity(&self, peer: &str, seen: &IdentityPublicKey) -> Result<(), Error> {
        // The mismatch must be committed, so the check result travels inside Ok.
        let checked = self
            .identities
            .transact(peer, |slot| match slot.as_mut() {
                Some(pin) => Ok(pin.check(peer, seen)),
                None => {
                    *slot = Some(PinnedIdentity::new(*seen));
                    Ok(Ok(()))
                }
            })
            .await?;
        checked.inspect_err(|_| warn!(peer, "identity key changed"))
    }

    async fn encrypt_session(
        &self,
        remote_device: &str,
        plaintext: &[u8],
    ) -> Result<SessionCiphertext, Error> {
        self.establish_session(remote_device).await?;
        let (local, now) = (self.device_id.as_str(), now());
        self.sessions
            .transact(&self.session_key(remote_device), |slot| {
                slot.as_mut()
                    .ok_or_else(|| Error::SessionNotFound {
                        local: local.to_string(),
                        remote: remote_device.to_string(),
                    })?
                    .encrypt(plaintext, now)
            })
            .await
    }

    async fn decrypt_session(
        &self,
        remote_device: &str,
        ciphertext: &SessionCiphertext,
    ) -> Result<Vec<u8>, Error> {
        match ciphertext {
            SessionCiphertext::PreKey(message) => self.decrypt_pre_key(remote_device, message).await,
            SessionCiphertext::Ratchet(message) => {
                let (local, now) = (self.device_id.as_str(), now());
                self.sessions
                    .transact(&self.session_key(remote_device), |slot| {
                        slot.as_mut()
                            .ok_or_else(|| Error::SessionNotFound {
                                local: local.to_string(),
                                remote: remote_device.to_string(),
                            })?
                            .decrypt(message, now)
                    })
                    .await
            }
        }
    }

    /// Decrypts with the session for the message's base key, running the
    /// responder handshake first when there is none.
    ///
    /// Nothing about the sender's identity is stored before the message
    /// authenticated: a first contact is pinned after decryption, and a
    /// changed key is held for approval only once the message proved it.
    async fn decrypt_pre_key(
        &self,
        remote_device: &str,
        message: &PreKeyMessage,
    ) -> Result<Vec<u8>, Error> {
        let identity = message.header.identity;
        let pinned = self.identities.get(remote_device).await?;
        if pinned.as_ref().is_some_and(|pin| pin.trusted != identity) {
            self.authenticate_pre_key(remote_device, message).await?;
            self.check_identity(remote_device, &identity).await?;
        }

        let plaintext = match self.decrypt_with_base_key(remote_device, message).await? {
            Some(plaintext) => plaintext,
            None => self.respond_to_pre_key(remote_device, message).await?,
        };
        if pinned.is_none() {
            self.check_identity(remote_device, &identity).await?;
        }
        Ok(plaintext)
    }

    async fn respond_to_pre_key(
        &self,
        remote_device: &str,
        message: &PreKeyMessage,
    ) -> Result<Vec<u8>, Error> {
        let _handshake = self.handshake.lock().await;
        if let Some(plaintext) = self.decrypt_with_base_key(remote_device, message).await? {
            return Ok(plaintext);
        }

        let session = establish_as_responder(
            &self.x3dh,
            &self.keys,
            &self.device_id,
            remote_device,
            &message.header,
            self.config.max_skipped_messages,
            now(),
        )
        .await?;

        let now = now();
        self.sessions
            .transact(&self.session_key(remote_device), move |slot| {
                let mut session = session;
                let plaintext = session.decrypt(&message.message, now)?;
                match slot.as_mut() {
                    Some(record) => {
                        if record.adopt(session) {
                            info!(remote_device, "session superseded by the peer's handshake");
                        } else {
                            info!(remote_device, "simultaneous handshake; ours stays current");
                        }
                    }
                    None => *slot = Some(SessionRecord::new(session)),
                }
                Ok(plaintext)
            })
            .await
    }

    /// Checks that a pre-key message decrypts without keeping the session or
    /// spending the one-time pre-key.
    async fn authenticate_pre_key(
        &self,
        remote_device: &str,
        message: &PreKeyMessage,
    ) -> Result<(), Error> {
        let mut session = preview_responder_session(
            &self.x3dh,
            &self.keys,
            &self.device_id,
            remote_device,
            &message.header,
            self.config.max_skipped_messages,
            now(),
        )
        .await?;
        session.decrypt(&message.message, now())?;
        Ok(())
    }

    async fn decrypt_with_base_key(
        &self,
        remote_device: &str,
        message: &PreKeyMessage,
    ) -> Result<Option<Vec<u8>>, Error> {
        let now = now();
        let header = &message.header;
        self.sessions
            .transact(&self.session_key(remote_device), |slot| {
                let session = slot
                    .as_mut()
                    .and_then(|record| record.session_mut(&header.ephemeral_key));
                match session {
                    Some(session) if session.remote_identity() == header.identity => {
                        session.decrypt(&message.message, now).map(Some)
                    }
                    _ => Ok(None),
                }
            })
            .await
    }

    async fn rekey_group<F>(
        &self,
        group_id: &str,
        channel_id: &str,
        change: F,
    ) -> Result<QueueEntry, Error>
    where
        F: FnOnce(&mut GroupChannel) -> Result<GroupKeyEpoch, Error> + Send,
    {
        let local = self.device_id.as_str();
        let (epoch, members) = self
            .groups
            .transact(&GroupChannel::storage_key(group_id, channel_id), |slot| {
                let channel = slot
                    .as_mut()
                    .ok_or_else(|| unknown_channel(group_id, channel_id))?;
                if !channel.is_member(local) {
                    return Err(Error::Protocol(format!(
                        "{local} is no longer a member of {group_id}/{channel_id}"
                    )));
                }
                let epoch = change(channel)?;
                let members = channel.members().map(str::to_string).collect::<Vec<_>>();
                Ok((epoch, members))
            })
            .await?;
        self.distribute(&epoch, members).await
    }

    async fn distribute(
        &self,
        epoch: &GroupKeyEpoch,
        members: Vec<DeviceId>,
    ) -> Result<QueueEntry, Error> {
        let messages = distribute_epoch(
            epoch,
            &self.device_id,
            members.iter().map(String::as_str),
            self,
        )
        .await?;

        let message_id = generate_message_id()?;
        let mut recipients = Vec::with_capacity(messages.len());
        let mut envelopes = Vec::with_capacity(messages.len());
        for (device, message) in messages {
            let mut envelope = Envelope::new(
                &self.device_id,
                Destination::Device(device.clone()),
                Payload::SenderKeyDistribution(message),
                now(),
            )?;
            envelope.id = message_id.clone();
            envelopes.push(envelope);
            recipients.push(device);
        }
        self.queue.enqueue(message_id, recipients, envelopes).await
    }
}

#[async_trait]
impl<S: KeyValueStore, D: KeyDirectory, T: Transport> PairwiseChannel for Messenger<S, D, T> {
    async fn wrap(&self, device: &str, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(self.encrypt_session(device, plaintext).await?.to_bytes())
    }

    async fn unwrap(&self, device: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let ciphertext = SessionCiphertext::from_bytes(wrapped)?;
        Ok(Zeroizing::new(self.decrypt_session(device, &ciphertext).await?))
    }
}

fn group_received(message: &GroupMessage, plaintext: Vec<u8>) -> Received {
    // The sender is authenticated by the group AEAD, unlike the envelope's.
    Received::Group {
        sender: message.sender_id.clone(),
        group_id: message.group_id.clone(),
        channel_id: message.channel_id.clone(),
        plaintext,
    }
}

fn unknown_channel(group_id: &str, channel_id: &str) -> Error {
    Error::Protocol(format!("unknown group {group_id}/{channel_id}"))
}

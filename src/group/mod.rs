//! Sender-Key group encryption layered on pairwise sessions.

mod channel;
mod distribution;
mod epoch;
mod message;
mod sender;

pub use channel::GroupChannel;
pub use distribution::{
    distribute_epoch, receive_distribution, EpochRequest, PairwiseChannel,
    SenderKeyDistributionMessage,
};
pub use epoch::GroupKeyEpoch;
pub use message::GroupMessage;
pub use sender::GroupSenderKeyState;

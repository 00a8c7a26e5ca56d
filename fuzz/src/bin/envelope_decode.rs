#[macro_use]
extern crate afl;
use hushwire::{Envelope, SessionCiphertext};

fn main() {
    fuzz!(|data: &[u8]| {
        let _ = Envelope::from_bytes(data);
        let _ = SessionCiphertext::from_bytes(data);
    });
}

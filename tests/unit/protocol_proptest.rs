use proptest::prelude::*;
use sshproxyplus::controller::protocol::{ControlMessage, SignedEnvelope};
use sshproxyplus::error::ControlError;

proptest! {
    #[test]
    fn signed_messages_verify(
        key in proptest::collection::vec(any::<u8>(), 0..64),
        message_type in "[a-z-]{1,24}",
        username in "[a-zA-Z0-9]{0,16}",
        proxy_id in any::<u64>(),
    ) {
        let msg = ControlMessage {
            username: username.clone(),
            ..ControlMessage::new(message_type.clone()).with_proxy(proxy_id)
        };
        let line = msg.sign(&key).unwrap().to_json().unwrap();
        let decoded = SignedEnvelope::from_json(&line).unwrap().verify(&key).unwrap();
        prop_assert_eq!(decoded.message_type, message_type);
        prop_assert_eq!(decoded.username, username);
        prop_assert_eq!(decoded.proxy_id, proxy_id);
    }

    #[test]
    fn flipped_bit_fails_verification(
        key in proptest::collection::vec(any::<u8>(), 1..32),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut envelope = ControlMessage::new("list-proxies").sign(&key).unwrap();
        let i = index.index(envelope.hmac.len());
        envelope.hmac[i] ^= 1 << bit;
        prop_assert!(matches!(envelope.verify(&key), Err(ControlError::HmacMismatch)));
    }

    #[test]
    fn other_key_fails_verification(
        key in proptest::collection::vec(any::<u8>(), 16),
        other in proptest::collection::vec(any::<u8>(), 16),
    ) {
        prop_assume!(key != other);
        let envelope = ControlMessage::new("list-proxies").sign(&key).unwrap();
        prop_assert!(matches!(envelope.verify(&other), Err(ControlError::HmacMismatch)));
    }
}

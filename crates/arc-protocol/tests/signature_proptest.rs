use arc_protocol::{Capsule, SigningKeypair};
use proptest::prelude::*;

fn keys(seed: u8) -> SigningKeypair {
    SigningKeypair::from_seed(&[seed; 32])
}

fn signed(question: &str, answer: &str, ts: u64) -> Capsule {
    let mut capsule = Capsule::new(question, answer, "main-hub", ts);
    capsule.sign(&keys(1)).expect("sign");
    capsule
}

proptest! {
    /// Freshly signed capsules always verify.
    #[test]
    fn signed_capsule_verifies(
        question in ".{0,200}",
        answer in ".{0,500}",
        ts in any::<u64>(),
    ) {
        let capsule = signed(&question, &answer, ts);
        prop_assert!(capsule.verify(&keys(1).verify_key_base64()));
    }

    /// Changing any signed field breaks verification.
    #[test]
    fn any_field_change_is_detected(
        question in "[a-z ]{1,80}",
        answer in "[a-z ]{1,80}",
        ts in 0u64..u64::MAX,
        field in 0usize..7,
    ) {
        let mut capsule = signed(&question, &answer, ts);
        match field {
            0 => capsule.capsule_id.push('x'),
            1 => capsule.question_hash.push('0'),
            2 => capsule.question_text.push('?'),
            3 => capsule.answer_text.push('!'),
            4 => capsule.compressed_embedding = Some("AAAA".into()),
            5 => capsule.source_id.push('2'),
            _ => capsule.timestamp += 1,
        }
        prop_assert!(!capsule.verify(&keys(1).verify_key_base64()));
    }

    /// A different authority's key never verifies.
    #[test]
    fn wrong_key_rejected(seed in 2u8..=255) {
        let capsule = signed("q", "a", 1);
        prop_assert!(!capsule.verify(&keys(seed).verify_key_base64()));
    }

    /// Re-signing is stable: signature is a function of the other fields.
    #[test]
    fn resign_is_deterministic(answer in ".{0,100}") {
        let mut capsule = signed("q", &answer, 7);
        let first = capsule.signature.clone();
        capsule.sign(&keys(1)).expect("sign");
        prop_assert_eq!(first, capsule.signature);
    }
}

#[test]
fn fallback_capsule_never_verifies() {
    let capsule = Capsule::fallback("Is the bridge open?", "mini-hub-1", 1);
    assert!(!capsule.verify(&keys(1).verify_key_base64()));
}

//! Property tests for the ObjectId hex codec.

use grix_hash::{HashAlgorithm, ObjectId};
use proptest::prelude::*;

proptest! {
    #[test]
    fn parse_format_roundtrip(bytes in proptest::array::uniform20(any::<u8>())) {
        let oid = ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap();
        let hex = oid.to_hex();
        prop_assert_eq!(hex.len(), 40);
        prop_assert!(hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        prop_assert_eq!(ObjectId::from_hex(&hex).unwrap(), oid);
    }

    #[test]
    fn uppercase_input_parses_to_same_oid(bytes in proptest::array::uniform32(any::<u8>())) {
        let oid = ObjectId::from_bytes(&bytes, HashAlgorithm::Sha256).unwrap();
        let upper = oid.to_hex().to_ascii_uppercase();
        prop_assert_eq!(ObjectId::from_hex(&upper).unwrap(), oid);
    }

    #[test]
    fn arbitrary_strings_never_panic(s in "\\PC*") {
        let _ = ObjectId::from_hex(&s);
        let _ = s.parse::<ObjectId>();
    }

    #[test]
    fn ordering_agrees_with_byte_order(
        a in proptest::array::uniform20(any::<u8>()),
        b in proptest::array::uniform20(any::<u8>()),
    ) {
        let oa = ObjectId::from_bytes(&a, HashAlgorithm::Sha1).unwrap();
        let ob = ObjectId::from_bytes(&b, HashAlgorithm::Sha1).unwrap();
        prop_assert_eq!(oa.cmp(&ob), a.cmp(&b));
    }
}

//! Property: XOR encryption is an involution
//!
//! For any byte range and any key, encrypting twice restores the input, and each byte is
//! XORed with the key byte at its position modulo 8.

use elfpack::encrypt::xor_in_place;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn xor_twice_restores_input(data in proptest::collection::vec(any::<u8>(), 0..2048), key in any::<u64>()) {
        let mut buf = data.clone();
        xor_in_place(&mut buf, key);
        xor_in_place(&mut buf, key);
        prop_assert_eq!(buf, data);
    }

    #[test]
    fn key_bytes_cycle_by_position(data in proptest::collection::vec(any::<u8>(), 0..512), key in any::<u64>()) {
        let mut buf = data.clone();
        xor_in_place(&mut buf, key);
        let key_bytes = key.to_le_bytes();
        for (i, (&plain, &cipher)) in data.iter().zip(&buf).enumerate() {
            prop_assert_eq!(plain ^ cipher, key_bytes[i % 8]);
        }
    }
}

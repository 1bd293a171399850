//! Xiaomi authentication cipher.
//!
//! The kettle authenticates with an RC4-family stream cipher keyed either by
//! a value mixed from the peripheral's MAC address and product id, or by the
//! session token. Every call to [`cipher`] runs its own key schedule on a
//! stack-local permutation, so encrypting and then decrypting with the same
//! key restores the input.

use crate::error::{Error, Result};

/// Length of the authentication token in bytes.
pub const TOKEN_LEN: usize = 12;

/// Authentication token shared with the peripheral for one device.
pub type Token = [u8; TOKEN_LEN];

/// Parse a colon separated MAC and return its octets last-first.
///
/// The peripheral stores its own address in that order.
///
/// # Examples
///
/// ```
/// use ble2mqtt_core::cipher::reverse_mac;
///
/// let mac = reverse_mac("AA:BB:CC:DD:EE:FF").unwrap();
/// assert_eq!(mac, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
/// ```
pub fn reverse_mac(mac: &str) -> Result<[u8; 6]> {
    let mut octets = [0u8; 6];
    let mut parts = mac.split(':');
    for slot in octets.iter_mut().rev() {
        let part = parts
            .next()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| Error::InvalidMac(mac.to_string()))?;
        *slot = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(mac.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(Error::InvalidMac(mac.to_string()));
    }
    Ok(octets)
}

/// Key used to encrypt the token during the first handshake write.
pub fn mix_a(mac: &[u8; 6], product_id: u16) -> [u8; 8] {
    let pid_lo = (product_id & 0xff) as u8;
    [mac[0], mac[2], mac[5], pid_lo, pid_lo, mac[4], mac[5], mac[1]]
}

/// Key used to decrypt peripheral-originated handshake frames.
pub fn mix_b(mac: &[u8; 6], product_id: u16) -> [u8; 8] {
    let pid_lo = (product_id & 0xff) as u8;
    let pid_hi = (product_id >> 8) as u8;
    [mac[0], mac[2], mac[5], pid_hi, mac[4], mac[0], mac[5], pid_lo]
}

/// Encrypt or decrypt `data` with `key`.
///
/// Keys are the fixed-size mixes and tokens of the handshake; an empty
/// key is rejected at compile time.
pub fn cipher<const N: usize>(key: &[u8; N], data: &[u8]) -> Vec<u8> {
    const { assert!(N > 0, "cipher key must not be empty") };

    let mut perm = [0u8; 256];
    for (i, slot) in perm.iter_mut().enumerate() {
        *slot = i as u8;
    }

    let mut j: u8 = 0;
    for i in 0..256 {
        j = j.wrapping_add(perm[i]).wrapping_add(key[i % N]);
        perm.swap(i, j as usize);
    }

    let mut index1: u8 = 0;
    let mut index2: u8 = 0;
    data.iter()
        .map(|byte| {
            index1 = index1.wrapping_add(1);
            index2 = index2.wrapping_add(perm[index1 as usize]);
            perm.swap(index1 as usize, index2 as usize);
            let idx = perm[index1 as usize].wrapping_add(perm[index2 as usize]);
            byte ^ perm[idx as usize]
        })
        .collect()
}

/// Generate a random session token.
pub fn generate_token() -> Token {
    rand::random()
}

/// Parse a token from its 24 character hex form.
pub fn parse_token(token: &str) -> Result<Token> {
    let bytes = hex::decode(token)
        .map_err(|e| Error::invalid_config(format!("token is not valid hex: {}", e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        Error::invalid_config(format!(
            "token must be {} bytes ({} hex characters), got {} bytes",
            TOKEN_LEN,
            TOKEN_LEN * 2,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn test_reverse_mac() {
        assert_eq!(
            reverse_mac(MAC).unwrap(),
            [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]
        );
        assert_eq!(
            reverse_mac("01:02:03:04:05:06").unwrap(),
            [0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_reverse_mac_lowercase() {
        assert_eq!(reverse_mac("aa:bb:cc:dd:ee:ff").unwrap(), reverse_mac(MAC).unwrap());
    }

    #[test]
    fn test_reverse_mac_rejects_malformed() {
        assert!(matches!(reverse_mac("AA:BB:CC:DD:EE"), Err(Error::InvalidMac(_))));
        assert!(matches!(reverse_mac("AA:BB:CC:DD:EE:FF:00"), Err(Error::InvalidMac(_))));
        assert!(matches!(reverse_mac("AA:BB:CC:DD:EE:GG"), Err(Error::InvalidMac(_))));
        assert!(matches!(reverse_mac("AABBCCDDEEFF"), Err(Error::InvalidMac(_))));
        assert!(matches!(reverse_mac(""), Err(Error::InvalidMac(_))));
    }

    #[test]
    fn test_mix_a() {
        let mac = reverse_mac(MAC).unwrap();
        // product id 275 = 0x0113
        assert_eq!(
            mix_a(&mac, 275),
            [0xFF, 0xDD, 0xAA, 0x13, 0x13, 0xBB, 0xAA, 0xEE]
        );
    }

    #[test]
    fn test_mix_b() {
        let mac = reverse_mac(MAC).unwrap();
        assert_eq!(
            mix_b(&mac, 275),
            [0xFF, 0xDD, 0xAA, 0x01, 0xBB, 0xFF, 0xAA, 0x13]
        );
    }

    #[test]
    fn test_cipher_matches_rc4_reference() {
        // RC4 test vector: key "Key", plaintext "Plaintext"
        assert_eq!(
            cipher(b"Key", b"Plaintext"),
            [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]
        );
    }

    #[test]
    fn test_cipher_calls_are_independent() {
        let first = cipher(b"key", b"same input");
        let second = cipher(b"key", b"same input");
        assert_eq!(first, second);
    }

    #[test]
    fn test_cipher_single_byte_key() {
        // A one-byte key repeats across the whole schedule.
        assert_eq!(cipher(&[0x2A], b"abc"), cipher(&[0x2A; 256], b"abc"));
    }

    #[test]
    fn test_cipher_empty_data() {
        assert!(cipher(b"key", &[]).is_empty());
    }

    #[test]
    fn test_parse_token() {
        let token = parse_token("015ccba8800abdc12eb8ed82").unwrap();
        assert_eq!(
            token,
            [0x01, 0x5C, 0xCB, 0xA8, 0x80, 0x0A, 0xBD, 0xC1, 0x2E, 0xB8, 0xED, 0x82]
        );
    }

    #[test]
    fn test_parse_token_rejects_bad_input() {
        assert!(matches!(parse_token("0102"), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            parse_token("zz5ccba8800abdc12eb8ed82"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_generate_token_is_random() {
        assert_ne!(generate_token(), generate_token());
    }

    proptest! {
        #[test]
        fn prop_cipher_round_trip(
            key in any::<[u8; 8]>(),
            data in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            prop_assert_eq!(cipher(&key, &cipher(&key, &data)), data);
        }

        #[test]
        fn prop_cipher_preserves_length(
            key in any::<Token>(),
            data in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            prop_assert_eq!(cipher(&key, &data).len(), data.len());
        }
    }
}

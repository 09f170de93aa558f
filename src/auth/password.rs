//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Tridove.
//
// Tridove is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tridove is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tridove. If not, see <http://www.gnu.org/licenses/>.

//! Password hashing for the user directory.
//!
//! Hashes are serialized as `$pbkdf2-sha256$<iterations>$<salt>$<hex>`. The
//! iteration count is stored with the hash, so it can be raised without
//! invalidating existing records.

use std::fmt::Write as _;

use openssl::hash::MessageDigest;
use rand::Rng;

use crate::support::error::Error;

const ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

// The traditional crypt(3) salt alphabet.
const SALT_CHARS: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz./";

pub fn hash_password(password: &str) -> Result<String, Error> {
    let mut rng = rand::thread_rng();
    let salt = (0..SALT_LEN)
        .map(|_| SALT_CHARS[rng.gen_range(0..SALT_CHARS.len())] as char)
        .collect::<String>();

    let key = derive(password, &salt, ITERATIONS)?;

    let mut hash = format!("$pbkdf2-sha256${}${}$", ITERATIONS, salt);
    for byte in key {
        let _ = write!(hash, "{:02x}", byte);
    }
    Ok(hash)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, Error> {
    let mut parts = hash.split('$');
    let (Some(""), Some("pbkdf2-sha256"), Some(iterations), Some(salt),
         Some(stored), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(Error::BadPasswordHash);
    };

    let iterations = iterations
        .parse::<u32>()
        .map_err(|_| Error::BadPasswordHash)?;
    let key = derive(password, salt, iterations)?;

    let mut derived = String::with_capacity(2 * KEY_LEN);
    for byte in key {
        let _ = write!(derived, "{:02x}", byte);
    }

    if derived.len() != stored.len() {
        return Ok(false);
    }

    Ok(openssl::memcmp::eq(derived.as_bytes(), stored.as_bytes()))
}

fn derive(
    password: &str,
    salt: &str,
    iterations: u32,
) -> Result<[u8; KEY_LEN], Error> {
    let mut key = [0u8; KEY_LEN];
    openssl::pkcs5::pbkdf2_hmac(
        password.as_bytes(),
        salt.as_bytes(),
        iterations as usize,
        MessageDigest::sha256(),
        &mut key,
    )?;
    Ok(key)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$pbkdf2-sha256$100000$"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
        assert!(!verify_password("", &hash).unwrap());
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("hunter2").unwrap();
        let b = hash_password("hunter2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_known_vector() {
        // Derived independently: PBKDF2-HMAC-SHA256("password",
        // "salt", 1 iteration, 32 bytes).
        let hash = "$pbkdf2-sha256$1$salt$\
                    120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b";
        assert!(verify_password("password", hash).unwrap());
        assert!(!verify_password("passwore", hash).unwrap());
    }

    #[test]
    fn malformed_hashes_are_errors() {
        assert_matches!(
            Err(Error::BadPasswordHash),
            verify_password("x", "$pbkdf2-sha1$1$salt$00")
        );
        assert_matches!(
            Err(Error::BadPasswordHash),
            verify_password("x", "not-a-hash")
        );
        assert_matches!(
            Err(Error::BadPasswordHash),
            verify_password("x", "$pbkdf2-sha256$zzz$salt$00")
        );
    }
}

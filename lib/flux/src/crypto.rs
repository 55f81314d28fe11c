use ctor::ctor;

/// Initialize the sodium infrastructure. Random byte generation is the only primitive this
/// workspace needs from libsodium; the wire protocol carries no per-packet encryption.
#[ctor(unsafe)]
fn init_sodium() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("cryptography initialization failed")
        }
    }
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut std::ffi::c_void, out.len());
    }
}

/// Generates an 8 hex-digit (4 byte) salt, the form new user records are stored with.
pub fn generate_salt_hex() -> String {
    let mut bytes = [0u8; 4];
    random_bytes(&mut bytes);
    hex::encode(bytes)
}

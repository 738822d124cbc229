use sha2::{Digest, Sha256};

/// Maps a job id onto a positive 63-bit lock key.
///
/// Takes the first eight bytes of SHA-256(job_id) as a big-endian integer and
/// clears the sign bit, so every process derives the same key for a job.
pub fn derive_lock_id(job_id: &str) -> i64 {
    let digest = Sha256::digest(job_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) & i64::MAX as u64) as i64
}

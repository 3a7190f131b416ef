use rand::Rng;
use uuid::Uuid;

/// Opaque entity id: 32 lowercase hex chars, safe for remote path segments.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn generate_scratch_name(prefix: &str) -> String {
    let mut rng = rand::rng();
    let rand_string: String = (0..10)
        .map(|_| {
            let idx = rng.random_range(0..26); // 0..=25
            (b'a' + idx) as char
        })
        .collect();

    format!("{}-{}", prefix, rand_string)
}

use chrono::Utc;
use rand::Rng;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `batch_<unix-millis>_<9 base36 chars>`, unique per submission.
pub fn new_batch_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("batch_{}_{}", Utc::now().timestamp_millis(), suffix)
}

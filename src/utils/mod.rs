pub mod cgat;
pub mod digit_trie;
pub mod rolling_encoder;

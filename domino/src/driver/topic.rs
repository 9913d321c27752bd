//! Topic pattern matching of the broadcast exchange.
//!
//! A binding pattern like `orders.*` or `orders.#` is matched against the routing key of the
//! message. The dot separates the words of the topic, `*` matches exactly one word and `#`
//! matches zero or more words, so `orders.#` matches `orders`, `orders.created` and
//! `orders.eu.created` as well.

pub fn match_routing_key(binding_key: &str, message_routing_key: &str) -> bool {
    let bks: Vec<_> = binding_key.split('.').collect();
    let mks: Vec<_> = message_routing_key.split('.').collect();

    match_words(&bks, &mks)
}

fn match_words(bks: &[&str], mks: &[&str]) -> bool {
    match bks.split_first() {
        None => mks.is_empty(),
        Some((&"#", rest)) => {
            // '#' either swallows nothing or one more word
            match_words(rest, mks) || (!mks.is_empty() && match_words(bks, &mks[1..]))
        }
        Some((&b_key, rest)) => match mks.split_first() {
            Some((&m_key, m_rest)) if b_key == "*" || b_key == m_key => match_words(rest, m_rest),
            _ => false,
        },
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing-Key Pattern Matching
//!
//! AMQP topic-style pattern matching used by the RPC delivery pipeline to
//! guard registrations against cross-talk: `*` matches exactly one
//! dot-delimited segment, `#` matches any number of trailing segments.

/// Evaluates whether a concrete routing key satisfies a wildcard pattern.
///
/// An empty pattern only matches an empty key (exact equality, not a
/// wildcard case). A `#` segment short-circuits to success; without one, a
/// segment-count mismatch fails.
pub fn matches(routing_key: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return routing_key.is_empty();
    }

    let key_segments: Vec<&str> = routing_key.split('.').collect();
    let pattern_segments: Vec<&str> = pattern.split('.').collect();

    for (idx, segment) in pattern_segments.iter().enumerate() {
        match *segment {
            "#" => return true,
            "*" => {
                if idx >= key_segments.len() {
                    return false;
                }
            }
            literal => {
                if key_segments.get(idx) != Some(&literal) {
                    return false;
                }
            }
        }
    }

    pattern_segments.len() == key_segments.len()
}

/// Evaluates whether a routing key satisfies any pattern of a set.
///
/// An empty set never matches.
pub fn matches_any<P: AsRef<str>>(routing_key: &str, patterns: &[P]) -> bool {
    patterns
        .iter()
        .any(|pattern| matches(routing_key, pattern.as_ref()))
}

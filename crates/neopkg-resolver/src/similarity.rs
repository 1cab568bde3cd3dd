use std::collections::HashMap;

/// Sørensen-Dice coefficient over the multisets of adjacent character pairs
/// of both strings, compared case-insensitively. Identical strings score 1.0;
/// a string shorter than two characters has no pairs and scores 0.0 against
/// anything else.
pub fn dice_coefficient(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }

    let a_pairs = bigrams(&a);
    let b_pairs = bigrams(&b);
    if a_pairs.is_empty() || b_pairs.is_empty() {
        return 0.0;
    }

    let mut remaining: HashMap<(char, char), usize> = HashMap::new();
    for pair in &b_pairs {
        *remaining.entry(*pair).or_default() += 1;
    }

    let mut shared = 0usize;
    for pair in &a_pairs {
        if let Some(count) = remaining.get_mut(pair) {
            if *count > 0 {
                *count -= 1;
                shared += 1;
            }
        }
    }

    (2 * shared) as f64 / (a_pairs.len() + b_pairs.len()) as f64
}

fn bigrams(input: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = input.chars().collect();
    chars.windows(2).map(|pair| (pair[0], pair[1])).collect()
}

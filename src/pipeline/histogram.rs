use crate::pipeline::key_color::KeyColor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorSample {
    pub count: u64,
    pub color: KeyColor,
}

pub fn parse_histogram(text: &str) -> impl Iterator<Item = ColorSample> + '_ {
    text.lines().filter_map(parse_histogram_line)
}

pub fn parse_histogram_line(line: &str) -> Option<ColorSample> {
    let count = parse_leading_count(line)?;
    let color = find_hex_color(line)?;
    Some(ColorSample { count, color })
}

// Strictly greater wins, so the first of equal counts is kept.
pub fn most_frequent_color<I>(samples: I, fallback: KeyColor) -> KeyColor
where
    I: IntoIterator<Item = ColorSample>,
{
    let mut best_count = 0u64;
    let mut best = fallback;
    for sample in samples {
        if sample.count > best_count {
            best_count = sample.count;
            best = sample.color;
        }
    }
    best
}

fn parse_leading_count(line: &str) -> Option<u64> {
    let trimmed = line.trim_start();
    let digits_len = trimmed
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits_len == 0 {
        return None;
    }
    let (digits, rest) = trimmed.split_at(digits_len);
    if !rest.starts_with(':') {
        return None;
    }
    digits.parse().ok()
}

fn find_hex_color(line: &str) -> Option<KeyColor> {
    line.match_indices('#').find_map(|(idx, _)| {
        let candidate = line.get(idx + 1..idx + 7)?;
        KeyColor::from_hex(candidate).ok()
    })
}

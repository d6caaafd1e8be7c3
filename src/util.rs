//! Small string helpers shared across modules

use chrono::NaiveDate;
use sha1::{Digest, Sha1};

/// Expand `{branch}`/`{Branch}`/`{BRANCH}` placeholders in a template and then
/// apply strftime-style date substitution.
///
/// `"nightly-{branch}"` with branch `dev` becomes `nightly-dev`;
/// `"{branch}%Y%m%d"` additionally expands the date.
pub fn branches_format(template: &str, branch: &str, date: NaiveDate) -> String {
    let s = template
        .replace("{branch}", &branch.to_lowercase())
        .replace("{Branch}", &title_case(branch))
        .replace("{BRANCH}", &branch.to_uppercase());

    if s.contains('%') {
        date.format(&s).to_string()
    } else {
        s
    }
}

/// First letter of each word upper-cased, the rest lowered.
fn title_case(s: &str) -> String {
    s.split_inclusive(|c: char| !c.is_alphanumeric())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect()
}

/// Repository name reduced to a form usable inside a container name.
pub fn sanitize_repo(repo: &str) -> String {
    repo.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

/// First 8 hex digits of the SHA-1 of the input.
pub fn short_fingerprint(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    hex::encode(digest)[..8].to_string()
}

//! 观察项与关联：多条观察共享关键词时合并提示

use std::collections::{BTreeMap, BTreeSet};

/// 一条观察
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// 来源：approvals / calendar / reminders / inbox / followups
    pub source: &'static str,
    pub text: String,
}

impl Observation {
    pub fn new(source: &'static str, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
        }
    }
}

const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "been", "before", "from", "have", "into", "just", "minutes", "more",
    "need", "overdue", "pending", "reminder", "request", "should", "some", "starts", "that", "their",
    "them", "then", "there", "these", "this", "those", "waiting", "what", "when", "will", "with",
    "your",
];

/// 小写、只保留字母数字、长度 >= 4、去停用词
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

fn find(parent: &mut [usize], i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    let mut node = i;
    while parent[node] != root {
        let next = parent[node];
        parent[node] = root;
        node = next;
    }
    root
}

/// 聚类：共享任一关键词的观察归入同一簇；每簇第一条追加 " (related to N other items)"
pub fn correlate(observations: &mut [Observation]) {
    let mut by_token: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, obs) in observations.iter().enumerate() {
        for token in tokenize(&obs.text) {
            by_token.entry(token).or_default().push(i);
        }
    }

    let mut parent: Vec<usize> = (0..observations.len()).collect();
    for members in by_token.values().filter(|m| m.len() >= 2) {
        let first = find(&mut parent, members[0]);
        for &other in &members[1..] {
            let root = find(&mut parent, other);
            if root != first {
                parent[root] = first;
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..observations.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }
    for members in clusters.values().filter(|m| m.len() >= 2) {
        let head = members[0];
        observations[head]
            .text
            .push_str(&format!(" (related to {} other items)", members.len() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Dentist appointment, with Dr. Kim! (2026)");
        assert!(tokens.contains("dentist"));
        assert!(tokens.contains("appointment"));
        assert!(tokens.contains("2026"));
        assert!(!tokens.contains("with"));
        assert!(!tokens.contains("kim"));
    }

    #[test]
    fn test_correlate_marks_first_of_cluster() {
        let mut obs = vec![
            Observation::new("calendar", "'Budget review' starts in 20 min"),
            Observation::new("inbox", "3 untriaged items in the inbox"),
            Observation::new("reminders", "Overdue reminder: send budget numbers"),
            Observation::new("approvals", "Approval req_1 waiting: update budget sheet"),
        ];
        correlate(&mut obs);
        assert!(obs[0].text.ends_with(" (related to 2 other items)"));
        assert!(!obs[1].text.contains("related"));
        assert!(!obs[2].text.contains("related"));
        assert!(!obs[3].text.contains("related"));
    }

    #[test]
    fn test_no_shared_tokens_no_suffix() {
        let mut obs = vec![
            Observation::new("calendar", "Dentist at noon"),
            Observation::new("inbox", "3 untriaged items"),
        ];
        let before = obs.clone();
        correlate(&mut obs);
        assert_eq!(obs, before);
    }
}

use rustc_hash::FxHashSet;

/// 以后缀封闭的域名集合：命中自身或任一祖先即视为包含。
/// 集合通常很小（屏蔽列表），逐级剥离最左标签查询即可。
#[derive(Debug, Default, Clone)]
pub struct DomainSet {
    set: FxHashSet<String>,
}

impl DomainSet {
    pub fn new() -> DomainSet {
        DomainSet::default()
    }

    /// 逗号分隔的一批域名。
    pub fn from_list(list: &str) -> DomainSet {
        let mut s = DomainSet::new();
        for d in list.split(',') {
            s.append(d);
        }
        s
    }

    /// 空串忽略；末尾补 '.' 归一化为 FQDN。
    pub fn append(&mut self, d: &str) {
        if d.is_empty() {
            return;
        }
        if d.ends_with('.') {
            self.set.insert(d.to_string());
        } else {
            self.set.insert(format!("{d}."));
        }
    }

    pub fn includes(&self, name: &str) -> bool {
        let mut d = name;
        loop {
            if self.set.contains(d) {
                return true;
            }
            match d.find('.') {
                // 根标签之前已无更多可剥离的标签
                Some(dot) if dot + 1 < d.len() => d = &d[dot + 1..],
                _ => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_match() {
        let mut ds = DomainSet::new();
        ds.append("com.");
        ds.append("net");
        for (d, want) in [
            ("example.com.", true),
            ("example.net.", true),
            ("deep.label.example.com.", true),
            ("example.org.", false),
            ("example.net.uk.", false),
            ("com.", true),
        ] {
            assert_eq!(ds.includes(d), want, "includes({d})");
        }
    }

    #[test]
    fn appends_normalize_and_skip_empty() {
        let ds = DomainSet::from_list("ads.example,,tracker.example.");
        assert_eq!(ds.len(), 2);
        assert!(ds.includes("foo.ads.example."));
        assert!(ds.includes("tracker.example."));
        assert!(!ds.includes("example."));
    }

    #[test]
    fn root_never_matches_implicitly() {
        let mut ds = DomainSet::new();
        ds.append("example.com");
        assert!(!ds.includes("com."));
        assert!(!ds.includes("."));
    }
}

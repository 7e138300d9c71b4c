use regex::Regex;
use tracing::warn;

/// 目录排除过滤器
///
/// 每个模式两侧各包一个 `*` 后做不区分大小写的整串匹配，
/// 即子串语义；模式内部的 `*`、`?`、`[...]` 仍按通配符处理。
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    patterns: Vec<String>,
    compiled: Vec<Regex>,
}

impl ExclusionFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kept = Vec::new();
        let mut compiled = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let source = format!("(?is)^{}$", glob_to_regex(&format!("*{}*", pattern)));
            match Regex::new(&source) {
                Ok(re) => {
                    kept.push(pattern.to_string());
                    compiled.push(re);
                }
                Err(e) => warn!("忽略无效的排除模式 {:?}: {}", pattern, e),
            }
        }

        Self {
            patterns: kept,
            compiled,
        }
    }

    /// 检查目录路径是否应被排除
    pub fn is_excluded(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        self.compiled.iter().any(|re| re.is_match(path))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// 把 fnmatch 风格的通配符翻译成正则
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                // 找不到闭合的 ] 时按字面量处理
                match chars.clone().position(|c| c == ']') {
                    Some(end) if end > 0 => {
                        let body: String = chars.by_ref().take(end).collect();
                        chars.next();
                        out.push('[');
                        let body = match body.strip_prefix('!') {
                            Some(negated) => {
                                out.push('^');
                                negated.to_string()
                            }
                            None => body,
                        };
                        out.push_str(&class_body(&body));
                        out.push(']');
                    }
                    _ => out.push_str("\\["),
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out
}

/// 字符类内部按字面量处理正则的集合运算符号
fn class_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len() * 2);
    let mut prev = None;

    for (i, c) in body.chars().enumerate() {
        match c {
            '^' if i == 0 => out.push_str("\\^"),
            '\\' | '[' | '&' | '~' | '|' => {
                out.push('\\');
                out.push(c);
            }
            '-' if prev == Some('-') => out.push_str("\\-"),
            _ => out.push(c),
        }
        prev = Some(c);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match_is_case_insensitive() {
        let filter = ExclusionFilter::new(["node_modules", "Cache"]);

        assert!(filter.is_excluded("web/node_modules"));
        assert!(filter.is_excluded("WEB/NODE_MODULES/pkg"));
        assert!(filter.is_excluded("app/.cache"));
        assert!(!filter.is_excluded("web/src"));
    }

    #[test]
    fn test_empty_patterns_exclude_nothing() {
        let filter = ExclusionFilter::new(Vec::<String>::new());
        assert!(filter.is_empty());
        assert!(!filter.is_excluded("anything/at/all"));
    }

    #[test]
    fn test_glob_characters_inside_pattern() {
        let filter = ExclusionFilter::new(["tmp?", "build[0-9]"]);

        assert!(filter.is_excluded("a/tmp1/b"));
        assert!(filter.is_excluded("out/build7"));
        assert!(!filter.is_excluded("out/buildx"));
        assert!(!filter.is_excluded("tmp"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let filter = ExclusionFilter::new(["a.b+c"]);

        assert!(filter.is_excluded("x/a.b+c/y"));
        assert!(!filter.is_excluded("x/aXbbc/y"));
    }

    #[test]
    fn test_class_caret_is_literal() {
        let filter = ExclusionFilter::new(["v[^x]"]);

        assert!(filter.is_excluded("dir/v^"));
        assert!(filter.is_excluded("dir/vx"));
        assert!(!filter.is_excluded("dir/vy"));

        let negated = ExclusionFilter::new(["v[!^]"]);
        assert!(negated.is_excluded("vy"));
        assert!(!negated.is_excluded("v^"));
    }

    #[test]
    fn test_class_set_operators_are_literal() {
        let filter = ExclusionFilter::new(["k[a&&b]", "t[a~~b]"]);

        assert_eq!(filter.patterns().len(), 2);
        assert!(filter.is_excluded("k&"));
        assert!(filter.is_excluded("kb"));
        assert!(!filter.is_excluded("kc"));
        assert!(filter.is_excluded("t~"));
        assert!(!filter.is_excluded("tc"));
    }

    #[test]
    fn test_double_dash_class_does_not_panic() {
        let filter = ExclusionFilter::new(["m[+--]", "n[a--z]"]);

        assert!(filter.patterns().contains(&"m[+--]".to_string()));
        assert!(filter.is_excluded("m-"));
        assert!(filter.is_excluded("m,"));
        assert!(!filter.is_excluded("ma"));
    }

    #[test]
    fn test_root_is_never_excluded() {
        let filter = ExclusionFilter::new(["*"]);
        assert!(!filter.is_excluded(""));
        assert!(filter.is_excluded("sub"));
    }
}

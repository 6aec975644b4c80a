//! 主题与订阅过滤器规则

use super::packet::{check_utf8, Error, QoS, Utf8Rules};

/// 共享订阅前缀
const SHARE: &str = "$share";
/// 旧版共享订阅前缀
const LEGACY_SHARE: &str = "$SharedSubscription";
/// 选择器前缀
const SELECT: &str = "$select";

/// topic 是否含有通配符
pub fn filter_has_wildcards(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// 校验客户端发布的主题
pub fn valid_publish_topic(topic: &str, max_levels: usize) -> Result<(), Error> {
    if topic.is_empty()
        || filter_has_wildcards(topic)
        || !check_utf8(topic, Utf8Rules::PUBLISH_TOPIC)
        || topic.split('/').count() > max_levels
    {
        return Err(bad_topic(topic));
    }

    // 以 $ 开头的topic不可以由用户publish
    if topic.starts_with('$') {
        let first = topic.split('/').next().unwrap_or_default();
        if first == SHARE || first == LEGACY_SHARE || first == SELECT {
            return Err(bad_topic(topic));
        }
        return Err(Error::BadSysTopic(sanitize(topic)));
    }

    Ok(())
}

pub fn valid_subscribe_filter(filter: &str) -> bool {
    // 不可以订阅空 filter
    if filter.is_empty() {
        return false;
    }

    let filters = filter.split('/').collect::<Vec<&str>>();
    if let Some((last, remaining)) = filters.split_last() {
        for entry in remaining.iter() {
            // # 字符只能在最后一位
            if entry.contains('#') {
                return false;
            }
            // + 字符必须独占一层
            if entry.len() != 1 && entry.contains('+') {
                return false;
            }
        }

        // 最后一位的 # 字符必须跟在 '/' 后面
        if last.len() != 1 && (last.contains('#') || last.contains('+')) {
            return false;
        }
    }

    true
}

/// 匹配发布消息使用的 topic 和 订阅的 filter
pub fn matches(topic: &str, filter: &str) -> bool {
    // 以 $ 开头的 topic 不能被通配符开头的 filter 匹配
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut topics = topic.split('/');
    let filters = filter.split('/');

    for f in filters {
        // # 字符匹配所有子级
        if f == "#" {
            return true;
        }

        let top = topics.next();
        match top {
            // + 字符直接匹配这一层
            Some(_) if f == "+" => continue,
            // 没有通配符，必须完全匹配
            Some(t) if f != t => return false,
            Some(_) => continue,
            // topic 层级不够了
            None => return false,
        }
    }

    // filter 层级不够了
    topics.next().is_none()
}

/// 选择器：按消息的 QoS 过滤投递
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// QoS=0
    AtMostOnce,
    /// QoS>0
    Reliable,
}

impl Selector {
    fn parse(expr: &str) -> Option<Self> {
        match expr {
            "QoS=0" => Some(Selector::AtMostOnce),
            "QoS>0" => Some(Selector::Reliable),
            _ => None,
        }
    }

    pub fn accepts(&self, qos: QoS) -> bool {
        match self {
            Selector::AtMostOnce => qos == QoS::AtMostOnce,
            Selector::Reliable => qos != QoS::AtMostOnce,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Selector::AtMostOnce => "QoS=0",
            Selector::Reliable => "QoS>0",
        }
    }
}

/// 共享订阅的分组
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub group: String,
    /// 是否使用旧版 $SharedSubscription 前缀
    pub legacy: bool,
}

/// 解析后的订阅
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    /// 订阅名，引擎中使用它标识订阅
    pub name: String,
    /// 去掉前缀后真正用于匹配的过滤器
    pub filter: String,
    pub share: Option<Share>,
    pub selector: Option<Selector>,
}

impl TopicSpec {
    pub fn is_shared(&self) -> bool {
        self.share.is_some()
    }
}

/// 解析客户端订阅的过滤器
///
/// * `$select/<expr>/<filter>`：按 QoS 选择
/// * `$share/<group>/<filter>`：订阅名为 `/<group>/<filter>`
/// * `$SharedSubscription/<group>/<filter>`：订阅名为 `<group>`
pub fn parse_subscription(raw: &str, max_levels: usize) -> Result<TopicSpec, Error> {
    if raw.is_empty() || !check_utf8(raw, Utf8Rules::TOPIC) {
        return Err(bad_topic(raw));
    }

    let mut rest = raw;
    let mut selector = None;
    if let Some(tail) = rest.strip_prefix(SELECT) {
        let tail = tail.strip_prefix('/').ok_or_else(|| bad_topic(raw))?;
        let (expr, filter) = tail.split_once('/').ok_or_else(|| bad_topic(raw))?;
        selector = Some(Selector::parse(expr).ok_or_else(|| bad_topic(raw))?);
        rest = filter;
    }

    let mut share = None;
    let mut name = None;
    for (prefix, legacy) in [(SHARE, false), (LEGACY_SHARE, true)] {
        let tail = match rest.strip_prefix(prefix).and_then(|t| t.strip_prefix('/')) {
            Some(tail) => tail,
            None => continue,
        };
        let (group, filter) = tail.split_once('/').ok_or_else(|| bad_topic(raw))?;
        if group.is_empty() || filter.is_empty() || filter_has_wildcards(group) {
            return Err(bad_topic(raw));
        }
        // 共享订阅不能订阅系统主题
        if filter.starts_with('$') {
            return Err(bad_topic(raw));
        }
        name = Some(if legacy {
            group.to_owned()
        } else {
            format!("/{}/{}", group, filter)
        });
        share = Some(Share {
            group: group.to_owned(),
            legacy,
        });
        rest = filter;
        break;
    }

    if !valid_subscribe_filter(rest) || rest.split('/').count() > max_levels {
        return Err(bad_topic(raw));
    }
    // 前缀必须完整，例如 $select 之后不能再跟 $select
    if share.is_none() && (rest.starts_with(SELECT) || rest.starts_with(LEGACY_SHARE)) {
        return Err(bad_topic(raw));
    }

    Ok(TopicSpec {
        name: name.unwrap_or_else(|| raw.to_owned()),
        filter: rest.to_owned(),
        share,
        selector,
    })
}

fn sanitize(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if Utf8Rules::TOPIC.rejects(c) { '?' } else { c })
        .collect()
}

fn bad_topic(topic: &str) -> Error {
    Error::BadTopic(sanitize(topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards_are_validated_correctly() {
        assert!(!filter_has_wildcards("a/b/c"));
        assert!(filter_has_wildcards("a/+/c"));
        assert!(filter_has_wildcards("a/b/#"));

        assert!(valid_subscribe_filter("#"));
        assert!(valid_subscribe_filter("+"));
        assert!(valid_subscribe_filter("a/+/c/#"));
        assert!(valid_subscribe_filter("/"));
        assert!(!valid_subscribe_filter(""));
        assert!(!valid_subscribe_filter("a/#/c"));
        assert!(!valid_subscribe_filter("a/b#"));
        assert!(!valid_subscribe_filter("a/b+/c"));
        assert!(!valid_subscribe_filter("a/+b"));
    }

    #[test]
    fn topics_match_with_filters_as_expected() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(matches("a/b/c", "a/+/c"));
        assert!(matches("a/b/c", "a/#"));
        assert!(matches("a", "a/#"));
        assert!(matches("a/b/c", "#"));
        assert!(!matches("a/b/c", "a/+"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("$SYS/a", "#"));
        assert!(!matches("$SYS/a", "+/a"));
        assert!(matches("$SYS/a", "$SYS/#"));
    }

    #[test]
    fn publish_topic_rules() {
        assert!(valid_publish_topic("a/b", 32).is_ok());
        assert!(valid_publish_topic("a/b/", 32).is_ok());
        assert!(matches!(valid_publish_topic("", 32), Err(Error::BadTopic(_))));
        assert!(matches!(valid_publish_topic("a/+", 32), Err(Error::BadTopic(_))));
        assert!(matches!(valid_publish_topic("a/#", 32), Err(Error::BadTopic(_))));
        assert!(matches!(valid_publish_topic("a/b/c", 2), Err(Error::BadTopic(_))));
        assert!(matches!(
            valid_publish_topic("$SYS/broker", 32),
            Err(Error::BadSysTopic(_))
        ));
        for topic in ["$share/g/a", "$SharedSubscription/g/a", "$select/QoS=0/a"] {
            assert!(matches!(valid_publish_topic(topic, 32), Err(Error::BadTopic(_))));
        }
        match valid_publish_topic("a\u{7}b", 32) {
            Err(Error::BadTopic(s)) => assert_eq!(s, "a?b"),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn shared_subscriptions() {
        let spec = parse_subscription("$share/grp/a/+", 32).unwrap();
        assert_eq!(spec.name, "/grp/a/+");
        assert_eq!(spec.filter, "a/+");
        assert_eq!(
            spec.share,
            Some(Share {
                group: "grp".to_owned(),
                legacy: false
            })
        );

        let spec = parse_subscription("$SharedSubscription/grp/a/#", 32).unwrap();
        assert_eq!(spec.name, "grp");
        assert_eq!(spec.filter, "a/#");
        assert!(spec.share.map(|s| s.legacy).unwrap_or_default());

        for bad in [
            "$share//a",
            "$share/grp/",
            "$share/grp",
            "$share/g+/a",
            "$SharedSubscription/x/$",
            "$share/grp/$SYS/#",
            "$share/grp/a/#/b",
        ] {
            assert!(
                matches!(parse_subscription(bad, 32), Err(Error::BadTopic(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn selectors() {
        let spec = parse_subscription("$select/QoS>0/a/b", 32).unwrap();
        assert_eq!(spec.selector, Some(Selector::Reliable));
        assert_eq!(spec.filter, "a/b");
        assert_eq!(spec.name, "$select/QoS>0/a/b");
        assert!(spec.selector.map(|s| s.accepts(QoS::AtLeastOnce)).unwrap_or_default());
        assert!(!Selector::Reliable.accepts(QoS::AtMostOnce));

        let spec = parse_subscription("$select/QoS=0/$share/grp/topic", 32).unwrap();
        assert_eq!(spec.name, "/grp/topic");
        assert_eq!(spec.selector, Some(Selector::AtMostOnce));

        for bad in ["$select/QoS=1/a", "$select/QoS=0", "$select"] {
            assert!(parse_subscription(bad, 32).is_err(), "{}", bad);
        }

        let plain = parse_subscription("$SYS/#", 32).unwrap();
        assert_eq!(plain.filter, "$SYS/#");
        assert!(plain.share.is_none());
    }
}

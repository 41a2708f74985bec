use mmg_service_registry::prelude::*;
use serde_json::json;

fn attrs(value: serde_json::Value) -> Attributes {
    serde_json::from_value(value).expect("attribute map")
}

#[test]
fn parse_and_display_round_to_canonical_text() {
    for src in [
        "(zone=eu)",
        "(zone=*)",
        "(name=ab*cd*)",
        "(port>=1024)",
        "(port<=65535)",
        "(&(a=1)(b=2))",
        "(|(a=1)(b=2))",
        "(!(a=1))",
    ] {
        assert_eq!(Filter::parse(src).expect(src).to_string(), src);
    }
    // 空白被忽略
    let spaced = Filter::parse(" ( & (a=1) (b=2) ) ").expect("spaced");
    assert_eq!(spaced.to_string(), "(&(a=1)(b=2))");
}

#[test]
fn escapes_survive_display() {
    let f: Filter = r"(path=a\(b\)\*)".parse().expect("escaped");
    assert_eq!(f, Filter::eq("path", "a(b)*"));
    assert_eq!(f.to_string(), r"(path=a\(b\)\*)");
    assert!(f.matches(&attrs(json!({ "path": "a(b)*" }))));
}

#[test]
fn normalization_flattens_sorts_and_dedups() {
    let f = Filter::parse("(&(b=2)(&(a=1)(c=3))(a=1))").expect("nested");
    assert_eq!(f.normalize().to_string(), "(&(a=1)(b=2)(c=3))");

    let g = Filter::parse("(|(z=1)(|(y=1))(z=1))").expect("or");
    assert_eq!(g.normalize().to_string(), "(|(y=1)(z=1))");

    let single = Filter::parse("(&(a=1)(a=1))").expect("dup");
    assert_eq!(single.normalize(), Filter::eq("a", "1"));

    let double = Filter::parse("(!(!(a=1)))").expect("not");
    assert_eq!(double.normalize(), Filter::eq("a", "1"));
}

#[test]
fn and_combinator_normalizes() {
    let f = Filter::eq("b", "2").and(Filter::eq("a", "1")).and(Filter::eq("b", "2"));
    assert_eq!(f.to_string(), "(&(a=1)(b=2))");
}

#[test]
fn equality_presence_and_substring_matching() {
    let a = attrs(json!({ "zone": "eu-west", "tags": ["fast", "cheap"], "up": true }));
    assert!(Filter::eq("zone", "eu-west").matches(&a));
    assert!(!Filter::eq("zone", "eu").matches(&a));
    assert!(Filter::present("tags").matches(&a));
    assert!(!Filter::present("missing").matches(&a));
    assert!(Filter::parse("(zone=eu*)").expect("prefix").matches(&a));
    assert!(Filter::parse("(zone=*west)").expect("suffix").matches(&a));
    assert!(Filter::parse("(zone=e*-*t)").expect("middle").matches(&a));
    assert!(!Filter::parse("(zone=us*)").expect("prefix").matches(&a));
    // 数组逐元素匹配
    assert!(Filter::eq("tags", "cheap").matches(&a));
    assert!(Filter::eq("up", "true").matches(&a));
}

#[test]
fn ordering_comparisons_are_numeric_when_possible() {
    let a = attrs(json!({ "port": 8080, "version": "b" }));
    assert!(Filter::parse("(port>=1024)").expect("ge").matches(&a));
    assert!(!Filter::parse("(port<=999)").expect("le").matches(&a));
    // 按数值比较；字典序下 "8080" < "900"
    assert!(Filter::parse("(port>=900)").expect("ge").matches(&a));
    assert!(Filter::parse("(version>=a)").expect("text").matches(&a));
    assert!(!Filter::parse("(version<=a)").expect("text").matches(&a));
}

#[test]
fn boolean_composition() {
    let a = attrs(json!({ "zone": "eu", "tier": "gold" }));
    assert!(Filter::parse("(&(zone=eu)(tier=gold))").expect("and").matches(&a));
    assert!(Filter::parse("(|(zone=us)(tier=gold))").expect("or").matches(&a));
    assert!(!Filter::parse("(!(zone=eu))").expect("not").matches(&a));
}

#[test]
fn malformed_filters_report_position() {
    let cases = [
        ("(a=b", 4),
        ("(a=b))", 5),
        ("(&)", 2),
        ("()", 1),
        ("(a~=b)", 2),
        ("a=b", 0),
    ];
    for (src, expected) in cases {
        match Filter::parse(src) {
            Err(RegistryError::InvalidFilter { position, filter, .. }) => {
                assert_eq!(position, expected, "{src}");
                assert_eq!(filter, src);
            }
            other => panic!("{src}: expected InvalidFilter, got {other:?}"),
        }
    }
    assert!(Filter::parse("(a>=1*)").is_err());
}

trait Cache {}

#[test]
fn query_keys_fold_type_and_filter() {
    let typed = QueryKey::of::<dyn Cache>(None);
    assert_eq!(typed, QueryKey::from_filter(Some(Filter::for_type::<dyn Cache>())));

    let a = QueryKey::of::<dyn Cache>(Some(Filter::eq("zone", "eu")));
    let b = QueryKey::from_filter(Some(Filter::eq("zone", "eu").and(Filter::for_type::<dyn Cache>())));
    assert_eq!(a, b);
    assert_eq!(a.as_str(), b.to_string());
    assert_ne!(a, typed);

    assert_eq!(QueryKey::all().as_str(), "*");
    assert!(QueryKey::all().matches(&Attributes::new()));
    assert!(!typed.matches(&Attributes::new()));
}

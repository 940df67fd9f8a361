// tests/property/admission_test.rs

//! Property-based tests for admission decisions

use flomd::FlomError;
use flomd::core::admission::{self, Admission};
use flomd::core::protocol::ResourceRequest;
use flomd::core::resource;
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_invalid_names_never_reach_lookup(name in "[ !#$%&*+,:;<=>?@^`|~]{1,20}") {
        let request = ResourceRequest::new(name.clone());
        let decision = admission::decide(&request, |_| panic!("lookup for an invalid name"));
        prop_assert_eq!(decision, Admission::Reject(FlomError::InvalidResourceName(name)));
    }

    #[test]
    fn test_valid_names_follow_create_and_wait(
        name in "[a-z][a-z0-9_]{0,15}",
        create in any::<bool>(),
        wait in any::<bool>(),
        existing in proptest::option::of(1u64..100),
    ) {
        let mut request = ResourceRequest::new(name.clone());
        request.create = create;
        request.wait = wait;

        let decision = admission::decide(&request, |key| {
            assert_eq!(key, name);
            existing
        });
        let expected = match (existing, create, wait) {
            (Some(id), _, _) => Admission::Attach(id),
            (None, true, _) => Admission::StartNew {
                key: name.clone(),
                kind: resource::ResourceKind::Simple,
            },
            (None, false, true) => Admission::Queue { key: name.clone() },
            (None, false, false) => Admission::Reject(FlomError::CantWait(name.clone())),
        };
        prop_assert_eq!(decision, expected);
    }

    #[test]
    fn test_hierarchical_key_is_a_prefix(path in proptest::collection::vec("[a-z]{1,6}", 1..5)) {
        let name = format!("/{}", path.join("/"));
        let kind = resource::classify(&name).unwrap();
        let key = resource::locker_key(&name, kind);
        prop_assert!(name.starts_with(&key));
        prop_assert_eq!(key, format!("/{}", path[0]));
    }
}

// File: tests/sriov_test.rs

use ib_sriov_cni::config::NetConf;
use ib_sriov_cni::netlink::mock::{Call, FakeNs, MockNetlink, Op};
use ib_sriov_cni::plugin::{SriovError, SriovManager, Step, VfState};
use proptest::prelude::*;

const HOST_FD: i32 = 3;
const POD_FD: i32 = 40;

const SETUP_ORDER: [Op; 5] = [
    Op::LinkByName,
    Op::LinkSetDown,
    Op::LinkSetName,
    Op::LinkSetNsFd,
    Op::LinkSetUp,
];

fn netconf() -> NetConf {
    NetConf {
        cni_version: "1.0.0".to_string(),
        name: "ib-net".to_string(),
        plugin_type: "ib-sriov".to_string(),
        master: "ib0".to_string(),
        device_id: "0000:af:06.0".to_string(),
        vf_id: 0,
        host_if_names: "ib1".to_string(),
        cont_if_names: "net1".to_string(),
    }
}

fn manager(mock: MockNetlink) -> SriovManager<MockNetlink, FakeNs> {
    SriovManager::new(mock, FakeNs::new(HOST_FD))
}

fn step_for(op: Op) -> Step {
    match op {
        Op::LinkByName => Step::Lookup,
        Op::LinkSetDown => Step::SetDown,
        Op::LinkSetName => Step::Rename,
        Op::LinkSetNsFd => Step::MoveNamespace,
        Op::LinkSetUp => Step::SetUp,
    }
}

#[test]
fn test_setup_call_order() {
    let sm = manager(MockNetlink::new().with_link(1000, "ib1"));
    let target = FakeNs::new(POD_FD);

    sm.setup_vf(&netconf(), "net1", "dummycid", &target).unwrap();

    assert_eq!(
        sm.netlink().calls(),
        vec![
            Call::LinkByName("ib1".to_string()),
            Call::LinkSetDown(1000),
            Call::LinkSetName(1000, "net1".to_string()),
            Call::LinkSetNsFd(1000, POD_FD),
            Call::LinkSetUp(1000),
        ]
    );
}

#[test]
fn test_lookup_failure_stops_both_directions() {
    let sm = manager(MockNetlink::new().fail_on(Op::LinkByName, "not found"));
    let ns = FakeNs::new(POD_FD);

    assert!(sm.setup_vf(&netconf(), "net1", "dummycid", &ns).is_err());
    assert!(sm.release_vf(&netconf(), "net1", "dummycid", &ns).is_err());
    assert_eq!(sm.netlink().ops(), vec![Op::LinkByName, Op::LinkByName]);
}

#[test]
fn test_setup_failure_at_each_stage() {
    for (pos, failing) in SETUP_ORDER.iter().enumerate().skip(1) {
        let sm = manager(
            MockNetlink::new()
                .with_link(1000, "ib1")
                .fail_on(*failing, "failed"),
        );

        let err = sm
            .setup_vf(&netconf(), "net1", "dummycid", &FakeNs::new(POD_FD))
            .unwrap_err();
        assert_eq!(err.step(), Some(step_for(*failing)), "failing {:?}", failing);

        for (i, op) in SETUP_ORDER.iter().enumerate() {
            let expected = if i <= pos { 1 } else { 0 };
            assert_eq!(sm.netlink().count(*op), expected, "{:?} when {:?} fails", op, failing);
        }
    }
}

#[test]
fn test_setup_set_down_fails_stops_early() {
    let sm = manager(
        MockNetlink::new()
            .with_link(1000, "ib1")
            .fail_on(Op::LinkSetDown, "failed"),
    );

    let err = sm
        .setup_vf(&netconf(), "net1", "dummycid", &FakeNs::new(POD_FD))
        .unwrap_err();

    assert!(matches!(err, SriovError::Step { step: Step::SetDown, .. }));
    assert_eq!(sm.netlink().ops(), vec![Op::LinkByName, Op::LinkSetDown]);
}

#[test]
fn test_setup_up_failure_leaves_link_in_target() {
    let sm = manager(
        MockNetlink::new()
            .with_link(1000, "ib1")
            .fail_on(Op::LinkSetUp, "failed"),
    );

    let err = sm
        .setup_vf(&netconf(), "net1", "dummycid", &FakeNs::new(POD_FD))
        .unwrap_err();
    assert_eq!(err.reached(), Some(VfState::Migrated));

    let state = sm.netlink().link(1000).unwrap();
    assert_eq!(state.name, "net1");
    assert_eq!(state.netns, Some(POD_FD));
    assert!(!state.admin_up);
}

#[test]
fn test_release_failure_at_each_stage() {
    let order = [Op::LinkByName, Op::LinkSetDown, Op::LinkSetName, Op::LinkSetNsFd];

    for (pos, failing) in order.iter().enumerate().skip(1) {
        let sm = manager(
            MockNetlink::new()
                .with_link_in(1000, "net1", POD_FD)
                .fail_on(*failing, "failed"),
        );

        let err = sm
            .release_vf(&netconf(), "net1", "dummycid", &FakeNs::new(POD_FD))
            .unwrap_err();
        assert_eq!(err.step(), Some(step_for(*failing)));

        for (i, op) in order.iter().enumerate() {
            let expected = if i <= pos { 1 } else { 0 };
            assert_eq!(sm.netlink().count(*op), expected);
        }
        assert_eq!(sm.netlink().count(Op::LinkSetUp), 0);
    }
}

#[test]
fn test_rename_collision_is_retryable() {
    let sm = manager(
        MockNetlink::new()
            .with_link(1000, "ib1")
            .with_link(1001, "net1"),
    );

    let err = sm
        .setup_vf(&netconf(), "net1", "dummycid", &FakeNs::new(POD_FD))
        .unwrap_err();

    assert_eq!(err.step(), Some(Step::Rename));
    assert!(err.is_retryable());
    let state = sm.netlink().link(1000).unwrap();
    assert_eq!(state.name, "ib1");
    assert!(!state.admin_up);
}

#[test]
fn test_retry_after_failed_move_finds_renamed_link() {
    let conf = netconf();
    let sm = manager(
        MockNetlink::new()
            .with_link(1000, "ib1")
            .fail_on(Op::LinkSetNsFd, "failed"),
    );
    let err = sm
        .setup_vf(&conf, "net1", "dummycid", &FakeNs::new(POD_FD))
        .unwrap_err();

    // The link is still on the host, but under its container name
    let parked = err.link().unwrap();
    assert_eq!(parked.name, "net1");
    assert_eq!(sm.netlink().index_of("net1"), Some(1000));
    assert_eq!(sm.netlink().index_of("ib1"), None);
}

#[test]
fn test_setup_then_release_restores_host_name() {
    let conf = netconf();
    let sm = manager(MockNetlink::new().with_link(1000, "ib1"));
    let pod = FakeNs::new(POD_FD);

    sm.setup_vf(&conf, "net1", "dummycid", &pod).unwrap();
    let link = sm.release_vf(&conf, "net1", "dummycid", &pod).unwrap();

    assert_eq!(link.name, "ib1");
    let state = sm.netlink().link(1000).unwrap();
    assert_eq!(state.name, "ib1");
    assert_eq!(state.netns, Some(HOST_FD));
    assert!(!state.admin_up);
    assert_eq!(sm.netlink().count(Op::LinkSetUp), 1);
}

fn ifname() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,14}"
}

proptest! {
    #[test]
    fn prop_setup_success_final_state(host in ifname(), pod in ifname(), index in 1u32..100_000) {
        prop_assume!(host != pod);
        let mut conf = netconf();
        conf.host_if_names = host.clone();

        let sm = manager(MockNetlink::new().with_link(index, &host));
        let link = sm.setup_vf(&conf, &pod, "cid", &FakeNs::new(POD_FD)).unwrap();

        prop_assert_eq!(&link.name, &pod);
        let state = sm.netlink().link(index).unwrap();
        prop_assert_eq!(state.name, pod);
        prop_assert_eq!(state.netns, Some(POD_FD));
        prop_assert!(state.admin_up);
    }

    #[test]
    fn prop_round_trip_leaves_vf_down_on_host(host in ifname(), pod in ifname()) {
        prop_assume!(host != pod);
        let mut conf = netconf();
        conf.host_if_names = host.clone();
        let pod_ns = FakeNs::new(POD_FD);

        let sm = manager(MockNetlink::new().with_link(1000, &host));
        sm.setup_vf(&conf, &pod, "cid", &pod_ns).unwrap();
        sm.release_vf(&conf, &pod, "cid", &pod_ns).unwrap();

        let state = sm.netlink().link(1000).unwrap();
        prop_assert_eq!(state.name, host);
        prop_assert_eq!(state.netns, Some(HOST_FD));
        prop_assert!(!state.admin_up);
    }
}

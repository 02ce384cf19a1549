//! End-to-end commitment protocol tests over a pair of channels wired
//! crosswise, exercising the full sign / revoke handshake in both
//! directions.

use crate::channel::{
    Channel, ChannelError, HtlcState, ReestablishAction, ResolutionResult, RevocationOutcome,
};
use crate::util::test_utils::*;

// Drive one full commitment exchange: `proposer` signs, `receiver`
// validates and revokes, `proposer` absorbs the revocation.  Returns the
// outcomes finalized on each side.
fn exchange(proposer: &mut Channel, receiver: &mut Channel) -> (RevocationOutcome, RevocationOutcome) {
    let (_info, sig) = proposer.sign_next_commitment().unwrap();
    let guard = receiver.receive_commitment_signed(&sig).unwrap();
    let (secret, next_point, receiver_outcome) =
        receiver.revoke_previous_commitment(guard).unwrap();
    let proposer_outcome = proposer.receive_revocation(secret, next_point).unwrap();
    proposer.check_conservation().unwrap();
    receiver.check_conservation().unwrap();
    (receiver_outcome, proposer_outcome)
}

#[test_log::test]
fn add_sign_revoke_settle_walkthrough_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(7), 1_000_000, 0);
    let preimage = test_preimage(5);
    let hash = preimage.payment_hash();

    let id = a.propose_add(10_000, hash, 500_000, vec![]).unwrap().id;
    assert_eq!(id, 0);
    b.receive_add(0, 10_000, hash, 500_000, vec![]).unwrap();

    let (b_outcome, a_outcome) = exchange(&mut a, &mut b);
    // the received add locked in on b's side, ready to forward
    assert_eq!(b_outcome.locked_in.len(), 1);
    assert_eq!(b_outcome.locked_in[0].payment_hash, hash);
    // only counterparty adds are surfaced for forwarding
    assert!(a_outcome.locked_in.is_empty());

    // 990,000 local, 10,000 pending
    assert_eq!(a.to_holder_msat(), 990_000);
    assert_eq!(b.to_counterparty_msat(), 990_000);
    assert_eq!(b.to_holder_msat(), 0);
    assert_eq!(b.get_htlc(crate::channel::HtlcDirection::Received, 0).unwrap().state, HtlcState::LockedIn);

    // settle backward
    b.propose_settle(0, preimage).unwrap();
    a.receive_settle(0, preimage).unwrap();
    let (a_outcome, b_outcome) = exchange(&mut b, &mut a);

    assert_eq!(a_outcome.resolutions.len(), 1);
    assert!(matches!(
        a_outcome.resolutions[0].result,
        ResolutionResult::Settled { preimage: p } if p == preimage
    ));
    assert_eq!(b_outcome.resolutions.len(), 1);

    // pending entry gone, value credited to the receiving side
    assert_eq!(a.to_holder_msat(), 990_000);
    assert_eq!(a.to_counterparty_msat(), 10_000);
    assert_eq!(b.to_holder_msat(), 10_000);
    assert_eq!(b.to_counterparty_msat(), 990_000);
    assert!(b.get_htlc(crate::channel::HtlcDirection::Received, 0).is_none());
    assert!(a.get_htlc(crate::channel::HtlcDirection::Offered, 0).is_none());
}

#[test_log::test]
fn failed_htlc_refunds_offerer_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(8), 1_000_000, 0);
    let preimage = test_preimage(6);
    let hash = preimage.payment_hash();

    a.propose_add(25_000, hash, 500_000, vec![]).unwrap();
    b.receive_add(0, 25_000, hash, 500_000, vec![]).unwrap();
    exchange(&mut a, &mut b);
    assert_eq!(a.to_holder_msat(), 975_000);

    b.propose_fail(0, vec![0xde, 0xad]).unwrap();
    a.receive_fail(0, vec![0xde, 0xad]).unwrap();
    let (a_outcome, _) = exchange(&mut b, &mut a);

    assert!(matches!(
        &a_outcome.resolutions[0].result,
        ResolutionResult::Failed { reason } if reason == &vec![0xde, 0xad]
    ));
    // full refund
    assert_eq!(a.to_holder_msat(), 1_000_000);
    assert_eq!(b.to_counterparty_msat(), 1_000_000);
}

#[test_log::test]
fn conservation_over_interleaved_traffic_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(9), 1_000_000, 400_000);
    // both sides have funds; run adds in both directions over several
    // rounds with settles and fails mixed in
    let p1 = test_preimage(1);
    let p2 = test_preimage(2);
    let p3 = test_preimage(3);

    a.propose_add(50_000, p1.payment_hash(), 500_000, vec![]).unwrap();
    b.receive_add(0, 50_000, p1.payment_hash(), 500_000, vec![]).unwrap();
    exchange(&mut a, &mut b);

    b.propose_add(30_000, p2.payment_hash(), 500_100, vec![]).unwrap();
    a.receive_add(0, 30_000, p2.payment_hash(), 500_100, vec![]).unwrap();
    exchange(&mut b, &mut a);

    // settle one, fail the other, add a third in the same batch
    b.propose_settle(0, p1).unwrap();
    a.receive_settle(0, p1).unwrap();
    exchange(&mut b, &mut a);

    a.propose_fail(0, vec![1]).unwrap();
    a.propose_add(70_000, p3.payment_hash(), 500_200, vec![]).unwrap();
    b.receive_fail(0, vec![1]).unwrap();
    b.receive_add(1, 70_000, p3.payment_hash(), 500_200, vec![]).unwrap();
    exchange(&mut a, &mut b);

    // a: 600,000 - 50,000 (settled away) - 70,000 (pending) + 30,000 (refunded fail? no:
    // the fail refunded b's 30,000 to b) = 480,000
    assert_eq!(a.to_holder_msat(), 480_000);
    assert_eq!(b.to_holder_msat(), 450_000);
    a.check_conservation().unwrap();
    b.check_conservation().unwrap();
}

#[test_log::test]
fn htlc_ids_strictly_increase_across_batches_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(10), 10_000_000, 0);
    let mut expected = 0u64;
    for round in 0..4 {
        for _ in 0..3 {
            let id = a
                .propose_add(10_000, test_payment_hash(round), 500_000, vec![])
                .unwrap()
                .id;
            assert_eq!(id, expected);
            b.receive_add(id, 10_000, test_payment_hash(round), 500_000, vec![]).unwrap();
            expected += 1;
        }
        exchange(&mut a, &mut b);
    }
    assert_eq!(a.state().next_holder_htlc_id, 12);
    assert_eq!(b.state().next_counterparty_htlc_id, 12);
}

#[test_log::test]
fn commit_numbers_advance_in_lockstep_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(11), 1_000_000, 0);
    for i in 0..3u64 {
        a.propose_add(10_000, test_payment_hash(i as u8), 500_000, vec![]).unwrap();
        b.receive_add(i, 10_000, test_payment_hash(i as u8), 500_000, vec![]).unwrap();
        exchange(&mut a, &mut b);
        assert_eq!(a.state().next_counterparty_commit_num, 2 + i);
        assert_eq!(b.state().next_holder_commit_num, 2 + i);
        assert_eq!(a.state().next_counterparty_revoke_num, 1 + i);
        assert_eq!(b.state().next_holder_revoke_num, 1 + i);
    }
}

#[test_log::test]
fn signature_mismatch_is_fatal_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(12), 1_000_000, 0);
    a.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    b.receive_add(0, 10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    let (_info, mut sig) = a.sign_next_commitment().unwrap();
    sig.0[0] ^= 0xff;
    let err = b.receive_commitment_signed(&sig).unwrap_err();
    assert!(err.is_fatal());
}

#[test_log::test]
fn fee_exposure_cap_rejects_commitment_test() {
    // cap below the commitment fee plus dust for even one HTLC
    let (mut a, mut b) = channel_pair_custom(test_channel_id(13), 1_000_000, 0, |_, setup_b| {
        setup_b.max_fee_exposure_msat = 100_000;
    });
    a.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    b.receive_add(0, 10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    let (_info, sig) = a.sign_next_commitment().unwrap();
    let err = b.receive_commitment_signed(&sig).unwrap_err();
    assert!(matches!(err, ChannelError::FeeExposure { .. }));
    assert!(err.is_fatal());
}

#[test_log::test]
fn bad_revocation_secret_is_fatal_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(14), 1_000_000, 0);
    a.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    b.receive_add(0, 10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    let (_info, sig) = a.sign_next_commitment().unwrap();
    let guard = b.receive_commitment_signed(&sig).unwrap();
    let (_secret, next_point, _outcome) = b.revoke_previous_commitment(guard).unwrap();
    // wrong secret: does not match the superseded commitment's point
    let err = a.receive_revocation([0x42; 32], next_point).unwrap_err();
    assert!(err.is_fatal());
}

#[test_log::test]
fn unexpected_revocation_is_fatal_test() {
    let (mut a, _b) = channel_pair(test_channel_id(15), 1_000_000, 0);
    let err = a
        .receive_revocation([0x42; 32], crate::wire::PubKey([2; 33]))
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test_log::test]
fn reestablish_in_sync_resumes_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(16), 1_000_000, 0);
    a.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    b.receive_add(0, 10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    exchange(&mut a, &mut b);

    let from_a = a.reestablish().unwrap();
    let from_b = b.reestablish().unwrap();
    assert_eq!(a.check_reestablish(&from_b).unwrap(), ReestablishAction::Resume);
    assert_eq!(b.check_reestablish(&from_a).unwrap(), ReestablishAction::Resume);
}

#[test_log::test]
fn reestablish_detects_lost_commitment_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(17), 1_000_000, 0);
    a.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    b.receive_add(0, 10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    // a signs but the commitment_signed never reaches b
    let (_info, _sig) = a.sign_next_commitment().unwrap();

    let from_b = b.reestablish().unwrap();
    assert_eq!(
        a.check_reestablish(&from_b).unwrap(),
        ReestablishAction::RetransmitCommitment
    );
}

#[test_log::test]
fn reestablish_peer_ahead_is_fatal_test() {
    let (a, mut b) = channel_pair(test_channel_id(18), 1_000_000, 0);
    let mut from_a = a.reestablish().unwrap();
    // peer claims to have seen a commitment we never signed
    from_a.next_commitment_number = 10;
    let err = b.check_reestablish(&from_a).unwrap_err();
    assert!(err.is_fatal());
}

#[test_log::test]
fn second_sign_blocked_until_revocation_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(19), 1_000_000, 0);
    a.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    b.receive_add(0, 10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    let (_info, sig) = a.sign_next_commitment().unwrap();

    a.propose_add(10_000, test_payment_hash(2), 500_000, vec![]).unwrap();
    assert_eq!(a.sign_next_commitment().unwrap_err(), ChannelError::UpdateInFlight);

    let guard = b.receive_commitment_signed(&sig).unwrap();
    let (secret, point, _) = b.revoke_previous_commitment(guard).unwrap();
    a.receive_revocation(secret, point).unwrap();

    // unblocked now
    b.receive_add(1, 10_000, test_payment_hash(2), 500_000, vec![]).unwrap();
    exchange(&mut a, &mut b);
    a.check_conservation().unwrap();
}

#[test_log::test]
fn crossed_adds_converge_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(21), 1_000_000, 400_000);
    let pa = test_preimage(3);
    let pb = test_preimage(4);
    // both sides propose an add and sign before seeing the other's add;
    // the update_adds cross the signatures on the wire
    a.propose_add(10_000, pa.payment_hash(), 500_000, vec![]).unwrap();
    b.propose_add(20_000, pb.payment_hash(), 500_100, vec![]).unwrap();
    let (_, sig_a) = a.sign_next_commitment().unwrap();
    let (_, sig_b) = b.sign_next_commitment().unwrap();
    a.receive_add(0, 20_000, pb.payment_hash(), 500_100, vec![]).unwrap();
    b.receive_add(0, 10_000, pa.payment_hash(), 500_000, vec![]).unwrap();

    // each signature covers only the signer's own add, and both sides
    // agree on that transcript
    let guard_b = b.receive_commitment_signed(&sig_a).unwrap();
    let (secret_b, point_b, outcome_b) = b.revoke_previous_commitment(guard_b).unwrap();
    let guard_a = a.receive_commitment_signed(&sig_b).unwrap();
    let (secret_a, point_a, outcome_a) = a.revoke_previous_commitment(guard_a).unwrap();
    assert_eq!(outcome_a.locked_in.len(), 1);
    assert_eq!(outcome_b.locked_in.len(), 1);
    a.receive_revocation(secret_b, point_b).unwrap();
    b.receive_revocation(secret_a, point_a).unwrap();
    a.check_conservation().unwrap();
    b.check_conservation().unwrap();

    // both adds locked in, traffic continues normally
    b.propose_settle(0, pa).unwrap();
    a.receive_settle(0, pa).unwrap();
    let (a_outcome, _) = exchange(&mut b, &mut a);
    assert_eq!(a_outcome.resolutions.len(), 1);
    assert_eq!(a.to_holder_msat(), 590_000);
    assert_eq!(b.to_holder_msat(), 390_000);
}

#[test_log::test]
fn settle_value_moves_at_finalizing_revocation_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(22), 1_000_000, 0);
    let preimage = test_preimage(7);
    let hash = preimage.payment_hash();
    a.propose_add(10_000, hash, 500_000, vec![]).unwrap();
    b.receive_add(0, 10_000, hash, 500_000, vec![]).unwrap();
    exchange(&mut a, &mut b);

    b.propose_settle(0, preimage).unwrap();
    a.receive_settle(0, preimage).unwrap();
    let (_, sig) = b.sign_next_commitment().unwrap();
    let guard = a.receive_commitment_signed(&sig).unwrap();
    // frozen but not finalized: the value still sits in the pending entry
    a.check_conservation().unwrap();
    b.check_conservation().unwrap();
    assert_eq!(a.to_counterparty_msat(), 0);
    let (secret, point, _) = a.revoke_previous_commitment(guard).unwrap();
    assert_eq!(a.to_counterparty_msat(), 10_000);
    b.receive_revocation(secret, point).unwrap();
    assert_eq!(b.to_holder_msat(), 10_000);
    b.check_conservation().unwrap();
}

#[test_log::test]
fn restore_from_persisted_state_test() {
    let (mut a, mut b) = channel_pair(test_channel_id(20), 1_000_000, 0);
    a.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    b.receive_add(0, 10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    exchange(&mut a, &mut b);

    // a "restarts" from its serializable state
    let state = a.state().clone();
    let setup = a.setup.clone();
    let signer = std::sync::Arc::new(crate::sign::MockSigner::new([0xaa; 32], [0xbb; 32]));
    let mut a2 = Channel::restore(a.id, setup, state, signer);
    a2.check_conservation().unwrap();
    assert_eq!(a2.to_holder_msat(), 990_000);

    // and continues the protocol where it left off
    let preimage = test_preimage(1);
    let hash = preimage.payment_hash();
    a2.propose_add(5_000, hash, 500_000, vec![]).unwrap();
    b.receive_add(1, 5_000, hash, 500_000, vec![]).unwrap();
    exchange(&mut a2, &mut b);
    assert_eq!(a2.to_holder_msat(), 985_000);
}

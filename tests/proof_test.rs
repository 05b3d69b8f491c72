//! Proof pipeline tests over realistic multi-receipt blocks.

use orchestrator::proof::{
    build_event_proof, verify_inclusion, BlockEvidence, EventProofRequest, LogData, ProofError,
    ReceiptData, ReceiptsTrie,
};
use orchestrator::testing::sample_evidence;

fn receipt(index: usize) -> ReceiptData {
    ReceiptData {
        // alternate legacy and EIP-2718 typed receipts
        tx_type: (index % 3) as u8,
        status: true,
        cumulative_gas_used: 21_000 * (index as u64 + 1),
        logs_bloom: format!("0x{}", hex::encode([0u8; 256])),
        logs: vec![LogData {
            address: format!("0x{}", hex::encode([index as u8; 20])),
            topics: vec![format!("0x{}", hex::encode([0x11; 32]))],
            data: format!("0x{:02x}", index),
        }],
    }
}

fn evidence_with_receipts(count: usize) -> BlockEvidence {
    let mut evidence = sample_evidence();
    evidence.receipts = (0..count).map(receipt).collect();
    let encoded: Vec<Vec<u8>> = evidence
        .receipts
        .iter()
        .map(|r| r.rlp_encoded().unwrap())
        .collect();
    evidence.header.receipts_root = ReceiptsTrie::from_encoded_receipts(&encoded).root_hash();
    evidence
}

fn request(index: usize) -> EventProofRequest {
    EventProofRequest {
        source_system_id: 1,
        destination_system_id: 2,
        source_contract: format!("0x{}", hex::encode([0x42; 20])),
        event_signature: "HoldCreated(bytes32,bytes32,bytes32,uint256)".into(),
        transaction_index: index,
    }
}

#[test]
fn test_proof_builds_for_every_transaction_index() {
    // 20 receipts forces branch nodes and inline-child edges in the trie
    let evidence = evidence_with_receipts(20);
    for index in 0..20 {
        let bundle = build_event_proof(&request(index), &evidence).unwrap();
        assert_eq!(bundle.source_system_id, 1);
        assert_eq!(bundle.destination_system_id, 2);
        assert!(bundle.encoded_info.starts_with("0x"));
        assert!(bundle.signature_or_proof.starts_with("0x"));
    }
}

#[test]
fn test_proof_is_deterministic() {
    let evidence = evidence_with_receipts(5);
    let a = build_event_proof(&request(3), &evidence).unwrap();
    let b = build_event_proof(&request(3), &evidence).unwrap();
    // re-observing the same event must produce the identical bundle
    assert_eq!(a, b);
}

#[test]
fn test_index_out_of_range_is_rejected() {
    let evidence = evidence_with_receipts(3);
    let err = build_event_proof(&request(3), &evidence).unwrap_err();
    assert!(matches!(err, ProofError::IndexOutOfRange { .. }));
}

#[test]
fn test_header_root_mismatch_is_fatal() {
    let mut evidence = evidence_with_receipts(4);
    evidence.header.receipts_root[0] ^= 0x01;
    let err = build_event_proof(&request(0), &evidence).unwrap_err();
    assert!(matches!(err, ProofError::RootMismatch { .. }));
}

#[test]
fn test_single_byte_witness_mutation_fails_verification() {
    let receipts: Vec<Vec<u8>> = (0..8).map(|i| receipt(i).rlp_encoded().unwrap()).collect();
    let trie = ReceiptsTrie::from_encoded_receipts(&receipts);
    let root = trie.root_hash();

    let mut witness = trie.prove(5);
    verify_inclusion(&root, 5, &receipts[5], &witness).unwrap();

    let last = witness.len() - 1;
    let tail = witness[last].len() - 1;
    witness[last][tail] ^= 0x01;
    assert!(verify_inclusion(&root, 5, &receipts[5], &witness).is_err());
}

#[test]
fn test_wrong_value_fails_verification() {
    let receipts: Vec<Vec<u8>> = (0..8).map(|i| receipt(i).rlp_encoded().unwrap()).collect();
    let trie = ReceiptsTrie::from_encoded_receipts(&receipts);
    let root = trie.root_hash();

    let witness = trie.prove(2);
    // the proof for index 2 must not vouch for index 3's receipt
    assert!(verify_inclusion(&root, 2, &receipts[3], &witness).is_err());
}

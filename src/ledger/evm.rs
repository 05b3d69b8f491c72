//! EVM ledger connector
//!
//! Talks to the interop manager contract deployed on an EVM network: hold
//! management, remote-call submission, validator sync, log scanning and
//! block evidence for the proof pipeline.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::str::FromStr;

use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, FixedBytes, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockTransactionsKind, Filter, Log, TransactionReceipt};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::transports::http::{Client, Http};
use tracing::{debug, info};

use crate::hash::{encode_account, encode_evm_address};
use crate::proof::{BlockEvidence, LogData, ReceiptData, SourceBlockHeader};
use crate::types::{LedgerKind, ProofBundle};

use super::{DecodedEvent, EventQuery, HoldRequest, LedgerConnector, LedgerError, TxOutcome};

sol! {
    #[sol(rpc)]
    contract InteropManager {
        event HoldCreated(bytes32 indexed operationId, bytes32 fromAccount, bytes32 toAccount, uint256 amount);
        event HoldExecuted(bytes32 indexed operationId);
        event HoldCancelled(bytes32 indexed operationId);
        event CrossChainCallExecuted(bytes32 indexed operationId, uint256 sourceSystemId);
        event ValidatorSetUpdated(uint256 validatorCount);

        function createHold(bytes32 operationId, bytes32 fromAccount, bytes32 toAccount, uint256 amount) external;
        function executeHold(bytes32 operationId) external;
        function cancelHold(bytes32 operationId) external;
        function performCallFromRemoteChain(uint256 sourceSystemId, bytes calldata encodedInfo, bytes calldata signatureOrProof) external;
        function setValidators(address[] calldata validators) external;
        function getValidators() external view returns (address[] memory);
    }
}

pub const HOLD_CREATED_SIG: &str = "HoldCreated(bytes32,bytes32,bytes32,uint256)";
pub const HOLD_EXECUTED_SIG: &str = "HoldExecuted(bytes32)";
pub const HOLD_CANCELLED_SIG: &str = "HoldCancelled(bytes32)";
pub const CROSS_CHAIN_CALL_EXECUTED_SIG: &str = "CrossChainCallExecuted(bytes32,uint256)";
pub const VALIDATOR_SET_UPDATED_SIG: &str = "ValidatorSetUpdated(uint256)";

pub struct EvmConnector {
    system_id: u64,
    rpc_url: String,
    contract_address: Address,
    signer: PrivateKeySigner,
    /// How many blocks back an unbounded scan reaches.
    scan_window: u64,
}

impl EvmConnector {
    pub fn new(
        system_id: u64,
        rpc_url: impl Into<String>,
        contract_address: &str,
        private_key: &str,
        scan_window: u64,
    ) -> Result<Self, LedgerError> {
        let contract_address = Address::from_str(contract_address)
            .map_err(|e| LedgerError::Configuration(format!("invalid contract address: {e}")))?;
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| LedgerError::Configuration(format!("invalid private key: {e}")))?;

        info!(
            system_id,
            contract = %contract_address,
            operator = %signer.address(),
            "EVM connector initialized"
        );

        Ok(Self {
            system_id,
            rpc_url: rpc_url.into(),
            contract_address,
            signer,
            scan_window,
        })
    }

    fn rpc_url(&self) -> Result<url::Url, LedgerError> {
        self.rpc_url
            .parse()
            .map_err(|e| LedgerError::Configuration(format!("invalid RPC URL: {e}")))
    }

    fn read_provider(&self) -> Result<impl Provider<Http<Client>> + Clone, LedgerError> {
        Ok(ProviderBuilder::new().on_http(self.rpc_url()?))
    }

    fn write_provider(&self) -> Result<impl Provider<Http<Client>> + Clone, LedgerError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        Ok(ProviderBuilder::new().wallet(wallet).on_http(self.rpc_url()?))
    }

}

fn outcome_from_receipt(receipt: &TransactionReceipt) -> Result<TxOutcome, LedgerError> {
    if !receipt.status() {
        return Err(LedgerError::Failed(format!(
            "transaction 0x{:x} reverted",
            receipt.transaction_hash
        )));
    }
    Ok(TxOutcome {
        tx_hash: format!("0x{:x}", receipt.transaction_hash),
        block_number: receipt.block_number.unwrap_or_default(),
        success: true,
    })
}

#[async_trait]
impl LedgerConnector for EvmConnector {
    fn kind(&self) -> LedgerKind {
        LedgerKind::Evm
    }

    fn system_id(&self) -> u64 {
        self.system_id
    }

    fn contract_address(&self) -> String {
        format!("0x{:x}", self.contract_address)
    }

    async fn create_hold(&self, request: &HoldRequest) -> Result<TxOutcome, LedgerError> {
        let provider = self.write_provider()?;
        let contract = InteropManager::new(self.contract_address, &provider);

        let operation_id = parse_bytes32(&request.operation_id)?;
        let amount = U256::from_str(&request.amount)
            .map_err(|_| LedgerError::Configuration(format!("invalid amount: {}", request.amount)))?;

        debug!(
            system_id = self.system_id,
            operation_id = %request.operation_id,
            amount = %amount,
            "submitting createHold"
        );
        let pending = contract
            .createHold(
                operation_id,
                account_bytes32(&request.from_account),
                account_bytes32(&request.to_account),
                amount,
            )
            .send()
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| LedgerError::from_message(format!("failed to get receipt: {e}")))?;
        outcome_from_receipt(&receipt)
    }

    async fn execute_hold(&self, operation_id: &str) -> Result<TxOutcome, LedgerError> {
        let provider = self.write_provider()?;
        let contract = InteropManager::new(self.contract_address, &provider);
        let pending = contract
            .executeHold(parse_bytes32(operation_id)?)
            .send()
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| LedgerError::from_message(format!("failed to get receipt: {e}")))?;
        outcome_from_receipt(&receipt)
    }

    async fn cancel_hold(&self, operation_id: &str) -> Result<TxOutcome, LedgerError> {
        let provider = self.write_provider()?;
        let contract = InteropManager::new(self.contract_address, &provider);
        let pending = contract
            .cancelHold(parse_bytes32(operation_id)?)
            .send()
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| LedgerError::from_message(format!("failed to get receipt: {e}")))?;
        outcome_from_receipt(&receipt)
    }

    async fn submit_remote_call(&self, proof: &ProofBundle) -> Result<TxOutcome, LedgerError> {
        let provider = self.write_provider()?;
        let contract = InteropManager::new(self.contract_address, &provider);
        let encoded_info = decode_hex_bytes(&proof.encoded_info)?;
        let signature_or_proof = decode_hex_bytes(&proof.signature_or_proof)?;

        debug!(
            system_id = self.system_id,
            source = proof.source_system_id,
            "submitting performCallFromRemoteChain"
        );
        let pending = contract
            .performCallFromRemoteChain(
                U256::from(proof.source_system_id),
                encoded_info.into(),
                signature_or_proof.into(),
            )
            .send()
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| LedgerError::from_message(format!("failed to get receipt: {e}")))?;
        outcome_from_receipt(&receipt)
    }

    async fn update_validators(&self, validators: &[String]) -> Result<TxOutcome, LedgerError> {
        let addresses: Vec<Address> = validators
            .iter()
            .map(|v| {
                Address::from_str(v)
                    .map_err(|e| LedgerError::Configuration(format!("invalid validator {v}: {e}")))
            })
            .collect::<Result<_, _>>()?;

        let provider = self.write_provider()?;
        let contract = InteropManager::new(self.contract_address, &provider);
        let pending = contract
            .setValidators(addresses)
            .send()
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| LedgerError::from_message(format!("failed to get receipt: {e}")))?;
        outcome_from_receipt(&receipt)
    }

    async fn read_validators(&self) -> Result<Vec<String>, LedgerError> {
        let provider = self.read_provider()?;
        let contract = InteropManager::new(self.contract_address, &provider);
        let current = contract
            .getValidators()
            .call()
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?;
        Ok(current._0.iter().map(|a| format!("0x{a:x}")).collect())
    }

    async fn scan_events(&self, query: &EventQuery) -> Result<Vec<DecodedEvent>, LedgerError> {
        let provider = self.read_provider()?;
        let head = provider
            .get_block_number()
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?;
        let from_block = query
            .from_block
            .unwrap_or_else(|| head.saturating_sub(self.scan_window));
        let to_block = query.to_block.unwrap_or(head);

        let filter = Filter::new()
            .address(self.contract_address)
            .event(&query.event_signature)
            .from_block(from_block)
            .to_block(to_block);
        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?;

        let mut matched = Vec::new();
        for log in &logs {
            let Some(event) = decode_log(&query.event_signature, log)? else {
                continue;
            };
            if query.matches(&event) {
                matched.push(event);
            }
        }
        debug!(
            system_id = self.system_id,
            event = %query.event_signature,
            from_block,
            to_block,
            matched = matched.len(),
            "event scan complete"
        );
        Ok(matched)
    }

    async fn latest_block(&self) -> Result<u64, LedgerError> {
        let provider = self.read_provider()?;
        provider
            .get_block_number()
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))
    }

    async fn block_evidence(&self, block_number: u64) -> Result<BlockEvidence, LedgerError> {
        let provider = self.read_provider()?;
        let block = provider
            .get_block_by_number(
                BlockNumberOrTag::Number(block_number),
                BlockTransactionsKind::Hashes,
            )
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?
            .ok_or_else(|| {
                LedgerError::Transient(format!("block {block_number} not available"))
            })?;
        let receipts = provider
            .get_block_receipts(BlockId::number(block_number))
            .await
            .map_err(|e| LedgerError::from_message(e.to_string()))?
            .ok_or_else(|| {
                LedgerError::Transient(format!("receipts for block {block_number} not available"))
            })?;

        Ok(BlockEvidence {
            header: convert_header(&block.header),
            receipts: receipts.iter().map(convert_receipt).collect(),
        })
    }
}

fn parse_bytes32(value: &str) -> Result<FixedBytes<32>, LedgerError> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| LedgerError::Configuration(format!("invalid bytes32 {value}: {e}")))?;
    if bytes.len() != 32 {
        return Err(LedgerError::Configuration(format!(
            "invalid bytes32 {value}: {} bytes",
            bytes.len()
        )));
    }
    Ok(FixedBytes::from_slice(&bytes))
}

/// Account identifiers are either EVM addresses (padded) or plain text
/// (left-padded, or hashed when over 32 bytes).
fn account_bytes32(account: &str) -> FixedBytes<32> {
    if let Ok(encoded) = encode_evm_address(account) {
        return FixedBytes::from(encoded);
    }
    FixedBytes::from(encode_account(account))
}

fn decode_hex_bytes(value: &str) -> Result<Vec<u8>, LedgerError> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| LedgerError::Configuration(format!("invalid hex payload: {e}")))
}

fn decode_log(signature: &str, log: &Log) -> Result<Option<DecodedEvent>, LedgerError> {
    let mut params = BTreeMap::new();
    let name = match signature {
        HOLD_CREATED_SIG => {
            let Ok(decoded) = log.log_decode::<InteropManager::HoldCreated>() else {
                return Ok(None);
            };
            let data = decoded.inner.data;
            params.insert("operationId".into(), format!("0x{:x}", data.operationId));
            params.insert("fromAccount".into(), format!("0x{:x}", data.fromAccount));
            params.insert("toAccount".into(), format!("0x{:x}", data.toAccount));
            params.insert("amount".into(), data.amount.to_string());
            "HoldCreated"
        }
        HOLD_EXECUTED_SIG => {
            let Ok(decoded) = log.log_decode::<InteropManager::HoldExecuted>() else {
                return Ok(None);
            };
            params.insert(
                "operationId".into(),
                format!("0x{:x}", decoded.inner.data.operationId),
            );
            "HoldExecuted"
        }
        HOLD_CANCELLED_SIG => {
            let Ok(decoded) = log.log_decode::<InteropManager::HoldCancelled>() else {
                return Ok(None);
            };
            params.insert(
                "operationId".into(),
                format!("0x{:x}", decoded.inner.data.operationId),
            );
            "HoldCancelled"
        }
        CROSS_CHAIN_CALL_EXECUTED_SIG => {
            let Ok(decoded) = log.log_decode::<InteropManager::CrossChainCallExecuted>() else {
                return Ok(None);
            };
            let data = decoded.inner.data;
            params.insert("operationId".into(), format!("0x{:x}", data.operationId));
            params.insert("sourceSystemId".into(), data.sourceSystemId.to_string());
            "CrossChainCallExecuted"
        }
        VALIDATOR_SET_UPDATED_SIG => {
            let Ok(decoded) = log.log_decode::<InteropManager::ValidatorSetUpdated>() else {
                return Ok(None);
            };
            params.insert(
                "validatorCount".into(),
                decoded.inner.data.validatorCount.to_string(),
            );
            "ValidatorSetUpdated"
        }
        other => {
            return Err(LedgerError::Configuration(format!(
                "unsupported event signature: {other}"
            )))
        }
    };

    Ok(Some(DecodedEvent {
        name: name.to_string(),
        params,
        tx_hash: log
            .transaction_hash
            .map(|h| format!("0x{h:x}"))
            .unwrap_or_default(),
        block_number: log.block_number.unwrap_or_default(),
        transaction_index: log.transaction_index.unwrap_or_default(),
    }))
}

fn convert_header(header: &alloy::rpc::types::Header) -> SourceBlockHeader {
    SourceBlockHeader {
        parent_hash: header.parent_hash.0,
        ommers_hash: header.ommers_hash.0,
        beneficiary: header.beneficiary.0 .0,
        state_root: header.state_root.0,
        transactions_root: header.transactions_root.0,
        receipts_root: header.receipts_root.0,
        logs_bloom: header.logs_bloom.0.to_vec(),
        difficulty: u64::try_from(header.difficulty).unwrap_or_default(),
        number: header.number,
        gas_limit: header.gas_limit as u64,
        gas_used: header.gas_used as u64,
        timestamp: header.timestamp,
        extra_data: header.extra_data.to_vec(),
        mix_hash: header.mix_hash.0,
        nonce: header.nonce.0,
        base_fee_per_gas: header.base_fee_per_gas.map(|v| v as u64),
    }
}

fn convert_receipt(receipt: &TransactionReceipt) -> ReceiptData {
    use alloy::consensus::TxReceipt;

    ReceiptData {
        tx_type: receipt.transaction_type() as u8,
        status: receipt.status(),
        cumulative_gas_used: receipt.inner.cumulative_gas_used() as u64,
        logs_bloom: format!("0x{}", hex::encode(receipt.inner.bloom().0)),
        logs: receipt
            .inner
            .logs()
            .iter()
            .map(|log| LogData {
                address: format!("0x{:x}", log.address()),
                topics: log
                    .topics()
                    .iter()
                    .map(|t| format!("0x{t:x}"))
                    .collect(),
                data: format!("0x{}", hex::encode(&log.data().data)),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::event_signature_hash;
    use alloy::sol_types::SolEvent;

    #[test]
    fn test_parse_bytes32() {
        let ok = parse_bytes32(&format!("0x{}", hex::encode([0xab; 32]))).unwrap();
        assert_eq!(ok.0, [0xab; 32]);
        assert!(parse_bytes32("0x1234").is_err());
        assert!(parse_bytes32("not-hex").is_err());
    }

    #[test]
    fn test_account_bytes32_handles_both_forms() {
        let text = account_bytes32("Alice");
        assert_eq!(&text.0[27..], b"Alice");

        let addr = account_bytes32("0xdead000000000000000000000000000000000000");
        assert_eq!(addr.0[12], 0xde);
        assert!(addr.0[..12].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_event_signatures_match_sol_bindings() {
        assert_eq!(
            event_signature_hash(HOLD_CREATED_SIG),
            InteropManager::HoldCreated::SIGNATURE_HASH.0
        );
        assert_eq!(
            event_signature_hash(HOLD_EXECUTED_SIG),
            InteropManager::HoldExecuted::SIGNATURE_HASH.0
        );
        assert_eq!(
            event_signature_hash(CROSS_CHAIN_CALL_EXECUTED_SIG),
            InteropManager::CrossChainCallExecuted::SIGNATURE_HASH.0
        );
    }
}

use crate::{config::RpcConfig, errors::UpstreamError};
use alloy::{
    network::TransactionBuilder as _,
    primitives::{Address, Bytes},
    providers::{Provider as _, RootProvider},
    rpc::types::TransactionRequest,
    sol,
    sol_types::SolCall,
};
use async_trait::async_trait;
use eyre::Context as _;
use reqwest::Client;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

sol! {
    contract IERC20 {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }
}

sol! {
    contract ILendingFactory {
        function controllers(uint256 i) external view returns (address);
        function n_collaterals() external view returns (uint256);
    }
}

sol! {
    contract IController {
        function loans(uint256 i) external view returns (address);
        function n_loans() external view returns (uint256);
        function user_state(address user) external view returns (uint256[4]);
        function debt(address user) external view returns (uint256);
        function loan_exists(address user) external view returns (bool);
        function borrowed_token() external view returns (address);
        function collateral_token() external view returns (address);
        function amm() external view returns (address);
    }
}

sol! {
    contract IControllerCamel {
        function borrowedToken() external view returns (address);
        function collateralToken() external view returns (address);
    }
}

sol! {
    contract IFeedRegistry {
        function getFeed(address base, address quote) external view returns (address aggregator);
    }
}

sol! {
    contract IAggregatorV3 {
        function decimals() external view returns (uint8);
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );
    }
}

/// One read-only `eth_call`: target contract plus ABI-encoded calldata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub to: Address,
    pub calldata: Bytes,
    /// Solidity signature, for logs.
    pub label: &'static str,
}

impl CallRequest {
    pub fn new<C: SolCall>(to: Address, call: &C) -> Self {
        Self {
            to,
            calldata: call.abi_encode().into(),
            label: C::SIGNATURE,
        }
    }

    /// Stable cache key: target address and calldata.
    pub fn cache_key(&self) -> String {
        format!("{:#x}:{}", self.to, hex::encode(&self.calldata))
    }
}

/// Decode raw return data for `C`. Empty or undecodable data means the contract has nothing
/// for us at this call, which is reported as `NotFound`.
pub fn decode<C: SolCall>(data: &[u8]) -> Result<C::Return, UpstreamError> {
    if data.is_empty() {
        return Err(UpstreamError::NotFound(format!(
            "{}: empty response",
            C::SIGNATURE
        )));
    }
    C::abi_decode_returns(data)
        .map_err(|e| UpstreamError::NotFound(format!("{}: undecodable return data: {e}", C::SIGNATURE)))
}

/// The boundary to an EVM node.
#[async_trait]
pub trait ContractCaller: Send + Sync {
    async fn call(&self, endpoint_url: &str, request: &CallRequest)
        -> Result<Bytes, UpstreamError>;

    /// Cheap liveness check used when building the endpoint pool.
    async fn probe(&self, endpoint_url: &str) -> Result<(), UpstreamError>;
}

/// [`ContractCaller`] over JSON-RPC with one cached provider per endpoint URL.
#[derive(Debug)]
pub struct AlloyCaller {
    timeout: Duration,
    connect_timeout: Duration,
    providers: Mutex<HashMap<String, RootProvider>>,
}

impl AlloyCaller {
    pub fn new(cfg: &RpcConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.request_timeout_seconds),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_seconds),
            providers: Mutex::new(HashMap::new()),
        }
    }

    fn provider_for_url(&self, url: &str) -> eyre::Result<RootProvider> {
        let mut cache = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = cache.get(url) {
            return Ok(p.clone());
        }
        let u: reqwest::Url = url
            .parse()
            .with_context(|| format!("invalid rpc url: {url}"))?;
        let client = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .context("build rpc http client")?;
        let http = alloy::transports::http::Http::with_client(client, u);
        let rpc_client = alloy::rpc::client::RpcClient::new(http, false);
        let p = RootProvider::new(rpc_client);
        cache.insert(url.to_owned(), p.clone());
        Ok(p)
    }

    fn provider(&self, url: &str) -> Result<RootProvider, UpstreamError> {
        // A bad URL is an endpoint failure like any other: count it and move on.
        self.provider_for_url(url)
            .map_err(|e| UpstreamError::Transient(format!("{e:#}")))
    }
}

#[async_trait]
impl ContractCaller for AlloyCaller {
    async fn call(
        &self,
        endpoint_url: &str,
        request: &CallRequest,
    ) -> Result<Bytes, UpstreamError> {
        let p = self.provider(endpoint_url)?;
        let tx = TransactionRequest::default()
            .with_to(request.to)
            .with_input(request.calldata.clone());
        p.call(tx)
            .await
            .map_err(|e| UpstreamError::classify(format!("{}: {e:#}", request.label)))
    }

    async fn probe(&self, endpoint_url: &str) -> Result<(), UpstreamError> {
        let p = self.provider(endpoint_url)?;
        p.get_block_number()
            .await
            .map(|_block| ())
            .map_err(|e| UpstreamError::classify(format!("get block number: {e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;
    use alloy::primitives::{address, U256};
    use alloy::sol_types::SolValue as _;

    #[test]
    fn cache_key_covers_target_and_arguments() {
        let c = address!("0x1111111111111111111111111111111111111111");
        let a = CallRequest::new(c, &IController::loansCall { i: U256::from(1) });
        let b = CallRequest::new(c, &IController::loansCall { i: U256::from(2) });
        assert_ne!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("0x1111111111111111111111111111111111111111:"));
        assert_eq!(a.label, "loans(uint256)");
    }

    #[test]
    fn decode_classifies_empty_data_as_not_found() {
        let err = decode::<IController::n_loansCall>(&[]).err();
        assert_eq!(err.map(|e| e.class()), Some(ErrorClass::NotFound));
    }

    #[test]
    fn decode_reads_user_state_words() -> eyre::Result<()> {
        let words = [U256::from(5), U256::ZERO, U256::from(7), U256::from(4)];
        let raw = words.abi_encode();
        let got = decode::<IController::user_stateCall>(&raw)?;
        assert_eq!(got, words);
        Ok(())
    }
}

use crate::{
    amount::base_units_to_decimal,
    cache::TtlCache,
    chain::{IController, IControllerCamel, IERC20, ILendingFactory},
    config::{self, PricesConfig, VaultscopeConfig},
    contracts::ContractQueryService,
    errors::{ErrorClass, UpstreamError},
    prices::{token_key, PriceAggregator},
};
use alloy::{
    primitives::{Address, U256},
    sol_types::SolCall,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

pub const TOKEN_CACHE_FILE: &str = "token_info_cache.json";
pub const LOAN_CACHE_FILE: &str = "loan_info_cache.json";

const UNKNOWN_NAME: &str = "Unknown Token";
const UNKNOWN_SYMBOL: &str = "???";
const DEFAULT_DECIMALS: u8 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Controller {
    pub address: Address,
    pub borrowed_token: Address,
    pub collateral_token: Address,
    pub amm: Option<Address>,
}

/// Raw position of one borrower, straight from `user_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub borrower: Address,
    pub debt_raw: U256,
    pub collateral_raw: U256,
}

/// Loans of one controller. `found` borrowers were enumerated, `read` of them answered.
#[derive(Debug, Clone, Default)]
pub struct LoanScan {
    pub found: usize,
    pub read: usize,
    pub loans: Vec<Loan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultSummary {
    pub controller: Address,
    pub borrowed: Token,
    pub collateral: Token,
    pub loans_reported: Option<u64>,
    pub loans_found: usize,
    pub loans_read: usize,
    pub open_loans: usize,
    pub total_debt: Decimal,
    pub total_collateral: Decimal,
    pub borrowed_price_usd: Decimal,
    pub collateral_price_usd: Decimal,
    pub total_debt_usd: Decimal,
    pub total_collateral_usd: Decimal,
}

/// One borrower's position in one controller, in whole tokens and USD.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub controller: Address,
    pub user: Address,
    pub borrowed: Token,
    pub collateral: Token,
    pub debt: Decimal,
    pub collateral_amount: Decimal,
    pub debt_usd: Decimal,
    pub collateral_usd: Decimal,
}

/// Every position of one user across the controllers of a factory.
#[derive(Debug, Clone, Serialize)]
pub struct UserPositions {
    pub factory: Address,
    pub user: Address,
    pub positions: Vec<Position>,
    pub total_debt_usd: Decimal,
    pub total_collateral_usd: Decimal,
    /// Controllers that could not be read; the totals leave them out.
    pub failed: Vec<Address>,
}

/// Grand totals over every controller a factory lists.
#[derive(Debug, Clone, Serialize)]
pub struct FactorySummary {
    pub factory: Address,
    pub vaults: usize,
    pub active_loans: usize,
    pub total_borrowed_usd: Decimal,
    pub total_collateral_usd: Decimal,
    /// Collateral value as a percentage of borrowed value; 0 when nothing is borrowed.
    pub collateralization_ratio: Decimal,
    pub summaries: Vec<VaultSummary>,
    pub failed: Vec<Address>,
}

/// Collateral over debt, in percent.
pub fn collateralization_ratio(collateral_usd: Decimal, borrowed_usd: Decimal) -> Decimal {
    collateral_usd
        .checked_div(borrowed_usd)
        .map_or(Decimal::ZERO, |r| r.saturating_mul(Decimal::ONE_HUNDRED))
}

/// Typed reads over lending factories and controllers.
pub struct LendingReader {
    contracts: Arc<ContractQueryService>,
    prices: Arc<PriceAggregator>,
    tokens: TtlCache<Token>,
    loans: TtlCache<Loan>,
    token_ttl: Option<Duration>,
    loan_ttl: Option<Duration>,
    prices_cfg: PricesConfig,
}

impl std::fmt::Debug for LendingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LendingReader")
            .field("tokens", &self.tokens.len())
            .field("loans", &self.loans.len())
            .finish_non_exhaustive()
    }
}

impl LendingReader {
    pub fn new(
        cfg: &VaultscopeConfig,
        cache_dir: &Path,
        contracts: Arc<ContractQueryService>,
        prices: Arc<PriceAggregator>,
    ) -> Self {
        Self {
            contracts,
            prices,
            tokens: TtlCache::open(cache_dir, TOKEN_CACHE_FILE),
            loans: TtlCache::open(cache_dir, LOAN_CACHE_FILE),
            token_ttl: config::ttl(cfg.cache.token_ttl_seconds),
            loan_ttl: config::ttl(cfg.cache.loan_ttl_seconds),
            prices_cfg: cfg.prices.clone(),
        }
    }

    /// Token metadata. Unreadable name or symbol become placeholders; only tokens whose
    /// decimals could be read are cached. Each field gets the batch retry budget.
    pub async fn token(&self, address: Address) -> Token {
        let key = token_key(address);
        if let Some(hit) = self.tokens.get(&key) {
            return hit;
        }

        let (name, symbol, decimals) = tokio::join!(
            self.bounded_read(address, &IERC20::nameCall {}),
            self.bounded_read(address, &IERC20::symbolCall {}),
            self.bounded_read(address, &IERC20::decimalsCall {}),
        );
        let token = Token {
            address,
            name: name.unwrap_or_else(|_| UNKNOWN_NAME.to_owned()),
            symbol: symbol.unwrap_or_else(|_| UNKNOWN_SYMBOL.to_owned()),
            decimals: *decimals.as_ref().unwrap_or(&DEFAULT_DECIMALS),
        };
        match decimals {
            Ok(_) => {
                if let Err(e) = self.tokens.set(&key, token.clone(), self.token_ttl) {
                    warn!(error = %e, "token cache write failed");
                }
            }
            Err(e) => warn!(token = %address, error = %e, "decimals unreadable; assuming 18"),
        }
        token
    }

    pub async fn controller(&self, address: Address) -> Result<Controller, UpstreamError> {
        let borrowed_token = self
            .address_accessor(
                address,
                &IController::borrowed_tokenCall {},
                &IControllerCamel::borrowedTokenCall {},
            )
            .await?;
        let collateral_token = self
            .address_accessor(
                address,
                &IController::collateral_tokenCall {},
                &IControllerCamel::collateralTokenCall {},
            )
            .await?;
        let amm = self
            .bounded_read(address, &IController::ammCall {})
            .await
            .ok();
        Ok(Controller {
            address,
            borrowed_token,
            collateral_token,
            amm,
        })
    }

    /// Cached read whose failure only costs one field.
    async fn bounded_read<C: SolCall>(
        &self,
        to: Address,
        call: &C,
    ) -> Result<C::Return, UpstreamError> {
        let settings = self.contracts.settings();
        self.contracts
            .call_cached_with(to, call, None, settings.contract_ttl, &settings.batch_policy)
            .await
    }

    /// Controllers expose their tokens under either snake_case or camelCase getters.
    async fn address_accessor<A, B>(
        &self,
        to: Address,
        snake: &A,
        camel: &B,
    ) -> Result<Address, UpstreamError>
    where
        A: SolCall<Return = Address>,
        B: SolCall<Return = Address>,
    {
        match self.contracts.call_cached(to, snake, None).await {
            Ok(a) => Ok(a),
            Err(e) if e.class() == ErrorClass::NotFound => {
                debug!(contract = %to, getter = A::SIGNATURE, "falling back to {}", B::SIGNATURE);
                self.contracts.call_cached(to, camel, None).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn discover_controllers(&self, factory: Address) -> Vec<Address> {
        self.contracts
            .discover(factory, |i| ILendingFactory::controllersCall { i })
            .await
    }

    pub async fn borrowers(&self, controller: Address) -> Vec<Address> {
        self.contracts
            .discover(controller, |i| IController::loansCall { i })
            .await
    }

    /// Open loans of `controller`. Positions with zero debt are dropped.
    pub async fn loans(&self, controller: Address) -> LoanScan {
        let borrowers = self.borrowers(controller).await;
        let mut scan = LoanScan {
            found: borrowers.len(),
            ..LoanScan::default()
        };

        let mut read: Vec<Loan> = Vec::with_capacity(borrowers.len());
        let mut missing = Vec::new();
        for b in &borrowers {
            match self.loans.get(&loan_key(controller, *b)) {
                Some(hit) => read.push(hit),
                None => missing.push(*b),
            }
        }

        let calls: Vec<(Address, IController::user_stateCall)> = missing
            .iter()
            .map(|user| (controller, IController::user_stateCall { user: *user }))
            .collect();
        let states = self.contracts.batch_call_cached(&calls).await;
        for (borrower, state) in missing.into_iter().zip(states) {
            let Some([collateral_raw, _, debt_raw, _]) = state else {
                continue;
            };
            let loan = Loan {
                borrower,
                debt_raw,
                collateral_raw,
            };
            if let Err(e) = self
                .loans
                .set(&loan_key(controller, borrower), loan.clone(), self.loan_ttl)
            {
                warn!(error = %e, "loan cache write failed");
            }
            read.push(loan);
        }

        scan.read = read.len();
        scan.loans = read.into_iter().filter(|l| !l.debt_raw.is_zero()).collect();
        if scan.read < scan.found {
            info!(controller = %controller, found = scan.found, read = scan.read, "some loans could not be read");
        }
        scan
    }

    pub async fn summarize(&self, controller: Address) -> eyre::Result<VaultSummary> {
        let ctl = self.controller(controller).await?;
        let (borrowed, collateral) = tokio::join!(
            self.token(ctl.borrowed_token),
            self.token(ctl.collateral_token)
        );
        let loans_reported = self
            .bounded_read(controller, &IController::n_loansCall {})
            .await
            .ok()
            .and_then(|n| u64::try_from(n).ok());
        let scan = self.loans(controller).await;

        let debt_raw = scan
            .loans
            .iter()
            .fold(U256::ZERO, |acc, l| acc.saturating_add(l.debt_raw));
        let collateral_raw = scan
            .loans
            .iter()
            .fold(U256::ZERO, |acc, l| acc.saturating_add(l.collateral_raw));
        let total_debt = base_units_to_decimal(debt_raw, borrowed.decimals)?;
        let total_collateral = base_units_to_decimal(collateral_raw, collateral.decimals)?;

        let (borrowed_price_usd, collateral_price_usd) =
            self.usd_prices(borrowed.address, collateral.address).await;

        Ok(VaultSummary {
            controller,
            loans_reported,
            loans_found: scan.found,
            loans_read: scan.read,
            open_loans: scan.loans.len(),
            total_debt_usd: total_debt.saturating_mul(borrowed_price_usd),
            total_collateral_usd: total_collateral.saturating_mul(collateral_price_usd),
            total_debt,
            total_collateral,
            borrowed_price_usd,
            collateral_price_usd,
            borrowed,
            collateral,
        })
    }

    /// USD prices of a controller's tokens. An unpriced borrowed token falls back to the fixed
    /// stablecoin table; unpriced collateral is worth zero.
    async fn usd_prices(&self, borrowed: Address, collateral: Address) -> (Decimal, Decimal) {
        let prices = self.prices.get_prices(&[borrowed, collateral]).await;
        let borrowed_price = prices
            .get(&borrowed)
            .copied()
            .or_else(|| self.prices_cfg.stable_price(&token_key(borrowed)))
            .unwrap_or(Decimal::ZERO);
        let collateral_price = prices.get(&collateral).copied().unwrap_or(Decimal::ZERO);
        (borrowed_price, collateral_price)
    }

    /// Raw `user_state` of one borrower, through the loan cache.
    async fn loan(&self, controller: Address, user: Address) -> Result<Loan, UpstreamError> {
        let key = loan_key(controller, user);
        if let Some(hit) = self.loans.get(&key) {
            return Ok(hit);
        }
        let [collateral_raw, _, debt_raw, _] = self
            .contracts
            .call_with(
                controller,
                &IController::user_stateCall { user },
                &self.contracts.settings().batch_policy,
            )
            .await?;
        let loan = Loan {
            borrower: user,
            debt_raw,
            collateral_raw,
        };
        if let Err(e) = self.loans.set(&key, loan.clone(), self.loan_ttl) {
            warn!(error = %e, "loan cache write failed");
        }
        Ok(loan)
    }

    /// Position of `user` in `controller`, or `None` when the controller has no loan for them.
    pub async fn position(
        &self,
        controller: Address,
        user: Address,
    ) -> eyre::Result<Option<Position>> {
        let exists = self
            .contracts
            .call_with(
                controller,
                &IController::loan_existsCall { user },
                &self.contracts.settings().batch_policy,
            )
            .await?;
        if !exists {
            debug!(controller = %controller, user = %user, "no loan");
            return Ok(None);
        }

        let ctl = self.controller(controller).await?;
        let loan = self.loan(controller, user).await?;
        let (borrowed, collateral) = tokio::join!(
            self.token(ctl.borrowed_token),
            self.token(ctl.collateral_token)
        );
        let debt = base_units_to_decimal(loan.debt_raw, borrowed.decimals)?;
        let collateral_amount = base_units_to_decimal(loan.collateral_raw, collateral.decimals)?;
        let (borrowed_price, collateral_price) =
            self.usd_prices(borrowed.address, collateral.address).await;

        Ok(Some(Position {
            controller,
            user,
            debt_usd: debt.saturating_mul(borrowed_price),
            collateral_usd: collateral_amount.saturating_mul(collateral_price),
            debt,
            collateral_amount,
            borrowed,
            collateral,
        }))
    }

    /// Positions of `user` in every controller of `factory`. Unreadable controllers are listed
    /// in `failed` and do not stop the scan.
    pub async fn positions(&self, factory: Address, user: Address) -> UserPositions {
        let controllers = self.discover_controllers(factory).await;
        let mut out = UserPositions {
            factory,
            user,
            positions: Vec::new(),
            total_debt_usd: Decimal::ZERO,
            total_collateral_usd: Decimal::ZERO,
            failed: Vec::new(),
        };
        for controller in controllers {
            match self.position(controller, user).await {
                Ok(Some(p)) => {
                    out.total_debt_usd = out.total_debt_usd.saturating_add(p.debt_usd);
                    out.total_collateral_usd =
                        out.total_collateral_usd.saturating_add(p.collateral_usd);
                    out.positions.push(p);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(controller = %controller, user = %user, error = %e, "position unreadable; skipping controller");
                    out.failed.push(controller);
                }
            }
        }
        info!(factory = %factory, user = %user, positions = out.positions.len(), failed = out.failed.len(), "positions scanned");
        out
    }

    /// Summarize every controller of `factory` one after another and add up the totals.
    /// A controller that fails to summarize is recorded and skipped.
    pub async fn summarize_factory(&self, factory: Address) -> FactorySummary {
        let controllers = self.discover_controllers(factory).await;
        let vaults = controllers.len();
        let mut summaries = Vec::with_capacity(vaults);
        let mut failed = Vec::new();

        for (i, controller) in controllers.into_iter().enumerate() {
            info!(vault = i.saturating_add(1), of = vaults, controller = %controller, "analyzing vault");
            match self.summarize(controller).await {
                Ok(s) => summaries.push(s),
                Err(e) => {
                    warn!(controller = %controller, error = %e, "vault summary failed; skipping");
                    failed.push(controller);
                }
            }
        }

        let active_loans = summaries.iter().map(|s| s.open_loans).sum();
        let total_borrowed_usd = summaries
            .iter()
            .fold(Decimal::ZERO, |acc, s| acc.saturating_add(s.total_debt_usd));
        let total_collateral_usd = summaries
            .iter()
            .fold(Decimal::ZERO, |acc, s| acc.saturating_add(s.total_collateral_usd));

        FactorySummary {
            factory,
            vaults,
            active_loans,
            collateralization_ratio: collateralization_ratio(
                total_collateral_usd,
                total_borrowed_usd,
            ),
            total_borrowed_usd,
            total_collateral_usd,
            summaries,
            failed,
        }
    }
}

fn loan_key(controller: Address, borrower: Address) -> String {
    format!("{controller:#x}:{borrower:#x}")
}

use tracing::warn;

use crate::config::LedgerOptions;
use crate::domain::{
    AccountId, Caller, Cents, Role, TransactionRecord, User, UserId, require_role,
};
use crate::storage::Repository;

use super::{AppError, Directory, IdentityProvider, IdentityService, LedgerService, TransactionResult};

const CUSTOMERS: &[Role] = &[Role::Customer];
const STAFF: &[Role] = &[Role::Banker, Role::Admin];

/// The front door of the bank.
///
/// Every operation resolves the caller from a token and checks their role exactly
/// once before touching the ledger. Customers act on their own account; staff
/// browse customers and their histories.
pub struct BankDesk<I = IdentityService> {
    identity: I,
    ledger: LedgerService,
}

impl BankDesk<IdentityService> {
    /// Initialize a database at the given path and open a desk on it.
    pub async fn init(database_path: &str, options: LedgerOptions) -> Result<Self, AppError> {
        let repo = Repository::init(database_path, &options).await?;
        Ok(Self::from_repository(repo, options))
    }

    /// Open a desk on an existing database.
    pub async fn connect(database_path: &str, options: LedgerOptions) -> Result<Self, AppError> {
        let repo = Repository::connect(database_path, &options, false).await?;
        Ok(Self::from_repository(repo, options))
    }

    fn from_repository(repo: Repository, options: LedgerOptions) -> Self {
        let identity = IdentityService::new(repo.clone(), options.session_ttl);
        Self::new(identity, LedgerService::new(repo, options))
    }
}

impl<I> BankDesk<I>
where
    I: IdentityProvider + Directory + Sync,
{
    pub fn new(identity: I, ledger: LedgerService) -> Self {
        Self { identity, ledger }
    }

    pub fn identity(&self) -> &I {
        &self.identity
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    async fn authorize(
        &self,
        token: &str,
        allowed: &[Role],
        operation: &'static str,
    ) -> Result<Caller, AppError> {
        let caller = self.identity.resolve_caller(token).await?;
        require_role(&caller, allowed).map_err(|role| {
            warn!(user_id = %caller.user_id, %role, operation, "operation forbidden");
            AppError::Forbidden { role, operation }
        })?;
        Ok(caller)
    }

    /// Deposit into the caller's own account.
    pub async fn deposit(&self, token: &str, amount_cents: Cents) -> Result<TransactionResult, AppError> {
        let caller = self.authorize(token, CUSTOMERS, "deposit").await?;
        self.ledger.deposit(caller.account_id(), amount_cents).await
    }

    /// Withdraw from the caller's own account.
    pub async fn withdraw(&self, token: &str, amount_cents: Cents) -> Result<TransactionResult, AppError> {
        let caller = self.authorize(token, CUSTOMERS, "withdraw").await?;
        self.ledger.withdraw(caller.account_id(), amount_cents).await
    }

    /// Balance of the caller's own account.
    pub async fn balance(&self, token: &str) -> Result<Cents, AppError> {
        let caller = self.authorize(token, CUSTOMERS, "view balance").await?;
        self.ledger.get_balance(caller.account_id()).await
    }

    /// History of the caller's own account, newest first.
    pub async fn my_transactions(&self, token: &str) -> Result<Vec<TransactionRecord>, AppError> {
        let caller = self.authorize(token, CUSTOMERS, "view transactions").await?;
        self.ledger.list_transactions(caller.account_id()).await
    }

    /// All customers, for staff browsing.
    pub async fn customers(&self, token: &str) -> Result<Vec<User>, AppError> {
        self.authorize(token, STAFF, "list customers").await?;
        self.identity.list_customers().await
    }

    /// History of a customer's account, newest first.
    pub async fn customer_transactions(
        &self,
        token: &str,
        customer_id: UserId,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        self.authorize(token, STAFF, "view customer transactions")
            .await?;
        let customer = self.customer(customer_id).await?;
        self.ledger.list_transactions(customer.account_id()).await
    }

    /// Balance of a customer's account.
    pub async fn customer_balance(&self, token: &str, customer_id: UserId) -> Result<Cents, AppError> {
        self.authorize(token, STAFF, "view customer balance").await?;
        let customer = self.customer(customer_id).await?;
        self.ledger.get_balance(customer.account_id()).await
    }

    /// The account a caller may read: their own, or for staff the named customer's.
    pub async fn viewable_account(
        &self,
        token: &str,
        customer_id: Option<UserId>,
    ) -> Result<AccountId, AppError> {
        match customer_id {
            None => Ok(self
                .authorize(token, CUSTOMERS, "view transactions")
                .await?
                .account_id()),
            Some(id) => {
                let caller = self.identity.resolve_caller(token).await?;
                if caller.role == Role::Customer && caller.user_id == id {
                    return Ok(caller.account_id());
                }
                require_role(&caller, STAFF).map_err(|role| AppError::Forbidden {
                    role,
                    operation: "view customer transactions",
                })?;
                Ok(self.customer(id).await?.account_id())
            }
        }
    }

    /// Balance of the account [`BankDesk::viewable_account`] resolves to.
    pub async fn viewable_balance(
        &self,
        token: &str,
        customer_id: Option<UserId>,
    ) -> Result<Cents, AppError> {
        let account_id = self.viewable_account(token, customer_id).await?;
        self.ledger.get_balance(account_id).await
    }

    /// Only customers own accounts; staff ids are not account ids.
    async fn customer(&self, id: UserId) -> Result<User, AppError> {
        let user = self.identity.get_user(id).await?;
        if user.role != Role::Customer {
            return Err(AppError::AccountNotFound(id.to_string()));
        }
        Ok(user)
    }
}

mod common;

use anyhow::Result;
use common::{funded_user, memory_service};
use finledger::application::AppError;
use finledger::domain::OperationType;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Deposit(i64),
    Withdraw(i64),
    Transfer(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..5_000).prop_map(Op::Deposit),
        (1i64..5_000).prop_map(Op::Withdraw),
        (1i64..5_000).prop_map(Op::Transfer),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn balance_always_matches_statement(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (ledger, users, _store) = memory_service();
            let alice = funded_user(&ledger, &users, "Alice", 0).await.unwrap();
            let bob = funded_user(&ledger, &users, "Bob", 0).await.unwrap();

            for op in ops {
                let result = match op {
                    Op::Deposit(amount) => ledger.deposit(alice.id, amount, "in").await.map(|_| ()),
                    Op::Withdraw(amount) => ledger.withdraw(alice.id, amount, "out").await.map(|_| ()),
                    Op::Transfer(amount) => ledger.transfer(alice.id, bob.id, amount, "move").await.map(|_| ()),
                };
                match result {
                    Ok(()) | Err(AppError::InsufficientFunds { .. }) => {}
                    Err(other) => panic!("unexpected error: {:?}", other),
                }

                for user_id in [alice.id, bob.id] {
                    let balance = ledger.get_balance(user_id).await.unwrap();
                    let deposits: i64 = balance
                        .statement
                        .iter()
                        .filter(|e| e.operation_type == OperationType::Deposit)
                        .map(|e| e.amount_cents)
                        .sum();
                    let withdrawals: i64 = balance
                        .statement
                        .iter()
                        .filter(|e| e.operation_type == OperationType::Withdraw)
                        .map(|e| e.amount_cents)
                        .sum();
                    assert_eq!(balance.balance, deposits - withdrawals);
                    assert!(balance.balance >= 0);
                }
            }

            let report = ledger.check_integrity().await.unwrap();
            assert!(report.is_healthy(), "issues: {:?}", report.issues);
        });
    }
}

#[tokio::test]
async fn test_store_outage_is_retryable_and_writes_nothing() -> Result<()> {
    let (ledger, users, store) = memory_service();
    let alice = funded_user(&ledger, &users, "Alice", 1000).await?;
    let bob = funded_user(&ledger, &users, "Bob", 0).await?;

    store.set_unavailable(true);

    let deposit = ledger.deposit(alice.id, 100, "in").await;
    assert!(matches!(deposit, Err(AppError::StoreUnavailable(_))));
    assert!(deposit.unwrap_err().is_retryable());

    let transfer = ledger.transfer(alice.id, bob.id, 100, "move").await;
    assert!(matches!(transfer, Err(AppError::StoreUnavailable(_))));

    assert!(matches!(
        ledger.get_balance(alice.id).await,
        Err(AppError::StoreUnavailable(_))
    ));

    store.set_unavailable(false);

    let balance = ledger.get_balance(alice.id).await?;
    assert_eq!(balance.balance, 1000);
    assert_eq!(balance.statement.len(), 1);
    assert!(ledger.get_balance(bob.id).await?.statement.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_user_registry_rejects_duplicates() -> Result<()> {
    let (_ledger, users, _store) = memory_service();

    users.create_user("Alice", "alice@finapi.com").await?;
    let duplicate = users.create_user("Alice Again", " Alice@FinAPI.com").await;

    assert!(matches!(duplicate, Err(AppError::UserAlreadyExists(_))));
    Ok(())
}

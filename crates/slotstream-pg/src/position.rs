use slotstream_core::Lsn;
use tracing::debug;

use crate::control::ControlSession;
use crate::error::PgResult;
use crate::version::ServerCapabilities;

/// Query the server's current WAL write position.
///
/// Returns [`Lsn::INVALID`] when the server reports nothing, e.g. on a
/// standby where the position function yields NULL.
pub async fn current_position<C: ControlSession + ?Sized>(
    control: &C,
    capabilities: &ServerCapabilities,
) -> PgResult<Lsn> {
    let position = match control
        .current_wal_position(capabilities.wal_position_function)
        .await?
    {
        Some(text) => Lsn::parse(&text)?,
        None => Lsn::INVALID,
    };

    debug!(lsn = %position, "Current WAL position");
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockControl;
    use crate::version::{ServerVersion, WalPositionFunction};

    #[tokio::test]
    async fn test_function_follows_version() {
        let control = MockControl::new();
        control.set_wal_position(Some("16/B374D848"));

        let modern = ServerCapabilities::resolve(ServerVersion::from_num(160002));
        let legacy = ServerCapabilities::resolve(ServerVersion::from_num(90624));

        let a = current_position(&control, &modern).await.unwrap();
        let b = current_position(&control, &legacy).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a, Lsn::new(0x16_B374_D848));
        assert_eq!(
            control.position_functions(),
            vec![
                WalPositionFunction::CurrentWalLsn,
                WalPositionFunction::CurrentXlogLocation
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_position_is_invalid() {
        let control = MockControl::new();
        control.set_wal_position(None);

        let capabilities = ServerCapabilities::resolve(ServerVersion::V10);
        let position = current_position(&control, &capabilities).await.unwrap();
        assert_eq!(position, Lsn::INVALID);
    }

    #[tokio::test]
    async fn test_garbage_position_fails() {
        let control = MockControl::new();
        control.set_wal_position(Some("not-an-lsn"));

        let capabilities = ServerCapabilities::resolve(ServerVersion::V10);
        let err = current_position(&control, &capabilities).await.unwrap_err();
        assert!(err.is_decode());
    }
}

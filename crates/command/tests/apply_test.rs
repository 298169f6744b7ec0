use fabric_command::{
    ApiError, Attribution, ChangeContext, CodecResult, Command, CommandRegistry, CommandType,
    MutationContext, NotFoundError, TypedCommand, cbor_body,
};
use fabric_db::{Bucket, Db};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Serialize, Deserialize)]
struct DeleteService {
    id: String,
}

impl Command for DeleteService {
    fn command_type(&self) -> CommandType {
        Self::TYPE
    }

    fn encode_body(&self) -> CodecResult<Vec<u8>> {
        cbor_body(self)
    }

    fn apply(&self, ctx: &mut MutationContext<'_, '_>) -> Result<(), ApiError> {
        let key = format!("services/{}", self.id);
        if !ctx.tx().contains(Bucket::Root, &key)? {
            return Err(ApiError::not_found("service", &self.id));
        }
        ctx.tx().delete(Bucket::Root, &key)?;

        let audit = format!("audit/{}", ctx.change().raft_index);
        let who = serde_json::to_vec(&ctx.change().attribution).map_err(|e| ApiError::internal(e.to_string()))?;
        ctx.tx().put(Bucket::Root, audit, who)?;
        Ok(())
    }

    fn attribution(&self) -> Option<Attribution> {
        Some(Attribution::Identity {
            id: "admin".to_string(),
            name: "Default Admin".to_string(),
        })
    }
}

impl TypedCommand for DeleteService {
    const TYPE: CommandType = 0x0002_0001;
}

fn apply_encoded(
    db: &Db,
    registry: &CommandRegistry,
    bytes: &[u8],
    index: u64,
) -> Result<(), ApiError> {
    let cmd = registry.decode(bytes).map_err(|e| ApiError::internal(e.to_string()))?;
    let change = ChangeContext::new(index, cmd.attribution());
    db.update(|tx| {
        let mut ctx = MutationContext::new(tx, change);
        cmd.apply(&mut ctx)
    })
}

#[test]
fn test_decoded_command_applies_with_change_context() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path().join("ctrl.db")).unwrap();
    db.update(|tx| tx.put(Bucket::Root, "services/web", b"{}"))
        .unwrap();

    let mut registry = CommandRegistry::new();
    registry.register::<DeleteService>().unwrap();

    let encoded = DeleteService {
        id: "web".to_string(),
    }
    .encode()
    .unwrap();

    apply_encoded(&db, &registry, &encoded, 41).unwrap();

    let (gone, audit) = db
        .view(|tx| {
            Ok::<_, fabric_db::DbError>((
                !tx.contains(Bucket::Root, "services/web")?,
                tx.get(Bucket::Root, "audit/41")?,
            ))
        })
        .unwrap();
    assert!(gone);
    let audit: Attribution = serde_json::from_slice(&audit.unwrap()).unwrap();
    assert!(matches!(audit, Attribution::Identity { ref id, .. } if id == "admin"));
}

#[test]
fn test_rejected_command_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path().join("ctrl.db")).unwrap();

    let mut registry = CommandRegistry::new();
    registry.register::<DeleteService>().unwrap();

    let encoded = DeleteService {
        id: "missing".to_string(),
    }
    .encode()
    .unwrap();

    let err = apply_encoded(&db, &registry, &encoded, 5).unwrap_err();
    let cause = err.cause_as::<NotFoundError>().unwrap();
    assert_eq!(cause.id, "missing");

    let audit = db.view(|tx| tx.scan_prefix(Bucket::Root, "audit/")).unwrap();
    assert!(audit.is_empty());
}

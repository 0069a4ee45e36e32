//! Classification of proxied RPC methods
//!
//! Every method the proxy forwards is listed here once. Routing decides on
//! the variant, never on the method name.

use crate::common::{Error, Result};
use crate::datastore::queue::ChangeType;

/// How a method is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rpc {
    /// Read-only; served by any healthy up to date node
    Accessor { method: &'static str, streaming: bool },
    /// Changes the repository; goes through a transaction
    Mutator {
        method: &'static str,
        change: ChangeType,
    },
}

impl Rpc {
    pub fn method(&self) -> &'static str {
        match self {
            Rpc::Accessor { method, .. } | Rpc::Mutator { method, .. } => *method,
        }
    }

    pub fn is_mutator(&self) -> bool {
        matches!(self, Rpc::Mutator { .. })
    }
}

const fn unary(method: &'static str) -> Rpc {
    Rpc::Accessor {
        method,
        streaming: false,
    }
}

const fn streaming(method: &'static str) -> Rpc {
    Rpc::Accessor {
        method,
        streaming: true,
    }
}

const fn mutator(method: &'static str, change: ChangeType) -> Rpc {
    Rpc::Mutator { method, change }
}

static METHODS: &[Rpc] = &[
    // accessors
    unary("RepositoryService/RepositoryExists"),
    unary("RepositoryService/RepositorySize"),
    unary("RepositoryService/HasLocalBranches"),
    unary("RepositoryService/ObjectFormat"),
    unary("RefService/FindDefaultBranchName"),
    unary("RefService/RefExists"),
    unary("CommitService/FindCommit"),
    unary("CommitService/CountCommits"),
    unary("CommitService/CommitIsAncestor"),
    streaming("RefService/FindAllBranches"),
    streaming("RefService/FindAllTags"),
    streaming("RefService/ListRefs"),
    streaming("CommitService/ListCommits"),
    streaming("BlobService/GetBlob"),
    streaming("BlobService/GetBlobs"),
    streaming("TreeService/GetTreeEntries"),
    streaming("SmartHTTPService/InfoRefsUploadPack"),
    streaming("SmartHTTPService/PostUploadPack"),
    streaming("RepositoryService/CreateBundle"),
    streaming("RepositoryService/GetArchive"),
    // mutators
    mutator("RepositoryService/CreateRepository", ChangeType::Create),
    mutator("RepositoryService/CreateRepositoryFromURL", ChangeType::Create),
    mutator("RepositoryService/CreateRepositoryFromBundle", ChangeType::Create),
    mutator("RepositoryService/CreateFork", ChangeType::Create),
    mutator("RepositoryService/WriteRef", ChangeType::Update),
    mutator("RepositoryService/FetchRemote", ChangeType::Update),
    mutator("RepositoryService/SetFullPath", ChangeType::Update),
    mutator("RefService/DeleteRefs", ChangeType::Update),
    mutator("OperationService/UserCreateBranch", ChangeType::Update),
    mutator("OperationService/UserDeleteBranch", ChangeType::Update),
    mutator("OperationService/UserCreateTag", ChangeType::Update),
    mutator("OperationService/UserCommitFiles", ChangeType::Update),
    mutator("OperationService/UserMergeBranch", ChangeType::Update),
    mutator("SmartHTTPService/PostReceivePack", ChangeType::Update),
    mutator("RepositoryService/RemoveRepository", ChangeType::Delete),
];

/// Resolve a method name to its routing class
pub fn classify(method: &str) -> Result<Rpc> {
    METHODS
        .iter()
        .find(|rpc| rpc.method() == method)
        .copied()
        .ok_or_else(|| Error::UnknownMethod(method.to_string()))
}

/// All known methods, for diagnostics
pub fn methods() -> impl Iterator<Item = &'static Rpc> {
    METHODS.iter()
}

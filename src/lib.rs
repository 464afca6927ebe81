pub mod crm;

// 重新导出常用类型和函数，方便外部使用
pub use crm::{
    entities::{AIProjectInsight, Client, Collection, Company, Entity, Project, Property, Task},
    sign_in_with_password,
    workspace::{Workspace, WorkspaceConfig},
    CollectionRepository, StoreError,
};

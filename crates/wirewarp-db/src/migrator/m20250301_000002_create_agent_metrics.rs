use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AgentMetric::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AgentMetric::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AgentMetric::AgentId).uuid().not_null())
                    .col(
                        ColumnDef::new(AgentMetric::RecordedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    // JSON object as reported by the agent
                    .col(ColumnDef::new(AgentMetric::Data).text().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_agent_metrics_agent_id")
                            .from(AgentMetric::Table, AgentMetric::AgentId)
                            .to(Agent::Table, Agent::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Latest samples per agent
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_agent_metrics_agent_recorded_at")
                    .table(AgentMetric::Table)
                    .col(AgentMetric::AgentId)
                    .col(AgentMetric::RecordedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AgentMetric::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AgentMetric {
    #[sea_orm(iden = "agent_metrics")]
    Table,
    Id,
    AgentId,
    RecordedAt,
    Data,
}

#[derive(DeriveIden)]
enum Agent {
    #[sea_orm(iden = "agents")]
    Table,
    Id,
}

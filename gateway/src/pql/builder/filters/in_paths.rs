use sea_query::{Expr, ExprTrait, JoinType};

use crate::pql::model::InPaths;
use crate::pql::preprocess::PqlError;

use super::FilterCompiler;
use super::super::{
    BaseTable, CteRef, Files, JoinedTables, QueryState, select_std_from_cte, wrap_query,
};

impl FilterCompiler for InPaths {
    fn build(&self, context: &CteRef, state: &mut QueryState) -> Result<CteRef, PqlError> {
        let cte_name = format!("n_{}_InPaths", state.cte_counter);

        let mut query = select_std_from_cte(context, state);
        query.join(
            JoinType::InnerJoin,
            Files::Table,
            Expr::col((Files::Table, Files::Id)).equals(context.column_ref("file_id")),
        );

        let mut prefixes = self.in_paths.in_paths.iter();
        let first = prefixes
            .next()
            .ok_or_else(|| PqlError::invalid("in_paths has no prefixes"))?;
        let mut cond = Expr::col((Files::Table, Files::Path)).like(format!("{first}%"));
        for prefix in prefixes {
            cond = cond.or(Expr::col((Files::Table, Files::Path)).like(format!("{prefix}%")));
        }
        query.and_where(cond);

        let mut joined_tables = JoinedTables::default();
        joined_tables.mark(BaseTable::Files);
        let cte = wrap_query(state, query, context, cte_name, &joined_tables);
        state.cte_counter += 1;
        Ok(cte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pql::model::EntityType;
    use serde_json::json;

    use super::super::test_support::{build_base_state, build_begin_cte, render_filter_sql};

    #[test]
    fn in_paths_builds_sql() {
        let filter: InPaths = serde_json::from_value(json!({
            "in_paths": { "in_paths": ["/movies/"] }
        }))
        .expect("in_paths filter");
        let mut state = build_base_state(EntityType::File, false);
        let context = build_begin_cte(&mut state);
        let sql = render_filter_sql(&filter, &mut state, &context);
        assert!(sql.contains("LIKE"));
        assert!(sql.contains("files"));
    }
}

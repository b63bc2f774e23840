use sea_query::{Expr, ExprTrait, JoinType};

use crate::pql::model::TypeIn;
use crate::pql::preprocess::PqlError;

use super::FilterCompiler;
use super::super::{
    BaseTable, CteRef, Items, JoinedTables, QueryState, select_std_from_cte, wrap_query,
};

impl FilterCompiler for TypeIn {
    fn build(&self, context: &CteRef, state: &mut QueryState) -> Result<CteRef, PqlError> {
        let cte_name = format!("n_{}_TypeIn", state.cte_counter);

        let mut query = select_std_from_cte(context, state);
        query.join(
            JoinType::InnerJoin,
            Items::Table,
            Expr::col((Items::Table, Items::Id)).equals(context.column_ref("item_id")),
        );

        let mut prefixes = self.type_in.type_in.iter();
        let first = prefixes
            .next()
            .ok_or_else(|| PqlError::invalid("type_in has no prefixes"))?;
        let mut cond = Expr::col((Items::Table, Items::Type)).like(format!("{first}%"));
        for prefix in prefixes {
            cond = cond.or(Expr::col((Items::Table, Items::Type)).like(format!("{prefix}%")));
        }
        query.and_where(cond);

        let mut joined_tables = JoinedTables::default();
        joined_tables.mark(BaseTable::Items);
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
    fn type_in_builds_sql() {
        let filter: TypeIn = serde_json::from_value(json!({
            "type_in": { "type_in": ["image"] }
        }))
        .expect("type_in filter");
        let mut state = build_base_state(EntityType::File, false);
        let context = build_begin_cte(&mut state);
        let sql = render_filter_sql(&filter, &mut state, &context);
        assert!(sql.contains("LIKE"));
        assert!(sql.contains("items"));
    }
}

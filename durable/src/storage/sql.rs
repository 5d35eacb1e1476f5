//! Parameterized SQL rendering of statements (PostgreSQL flavour, `jsonb`
//! for document columns). Used for tracing and by SQL-backed stores.

use std::fmt::Write;

use super::{Column, Datum, Expr, ID_COLUMN, Statement};

struct Params(Vec<Datum>);

impl Params {
    fn bind(&mut self, value: Datum) -> String {
        self.0.push(value);
        format!("${}", self.0.len())
    }
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn column_expr(column: &Column) -> String {
    match column {
        Column::Plain(name) => ident(name),
        Column::Doc { column, key } => format!("{}->{}", ident(column), literal(key)),
    }
}

fn expr_sql(expr: &Expr, params: &mut Params) -> String {
    match expr {
        Expr::Column(column) => column_expr(column),
        Expr::Param(value) => params.bind(value.clone()),
        Expr::Binary { op, lhs, rhs } => {
            format!("({} {} {})", expr_sql(lhs, params), op.symbol(), expr_sql(rhs, params))
        }
    }
}

impl Statement {
    pub fn to_sql(&self) -> (String, Vec<Datum>) {
        let mut params = Params(Vec::new());
        let sql = match self {
            Statement::NextId { table } => {
                format!("SELECT nextval({})", literal(&format!("{table}_id_seq")))
            }
            Statement::Insert { table, id, row } | Statement::Upsert { table, id, row } => {
                let mut columns = vec![ident(ID_COLUMN)];
                let mut values = vec![params.bind(Datum::from(*id))];
                for (column, value) in row {
                    columns.push(ident(column));
                    values.push(params.bind(value.clone()));
                }
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    ident(table),
                    columns.join(", "),
                    values.join(", ")
                );
                if matches!(self, Statement::Upsert { .. }) && !row.is_empty() {
                    let updates: Vec<_> = row
                        .keys()
                        .map(|c| format!("{0} = EXCLUDED.{0}", ident(c)))
                        .collect();
                    let _ = write!(sql, " ON CONFLICT ({}) DO UPDATE SET {}", ident(ID_COLUMN), updates.join(", "));
                }
                sql
            }
            Statement::Select { table, id, columns } => {
                let selected: Vec<_> = columns.iter().map(column_expr).collect();
                format!(
                    "SELECT {} FROM {} WHERE {} = {}",
                    selected.join(", "),
                    ident(table),
                    ident(ID_COLUMN),
                    params.bind(Datum::from(*id))
                )
            }
            Statement::SelectRow { table, id } => format!(
                "SELECT * FROM {} WHERE {} = {}",
                ident(table),
                ident(ID_COLUMN),
                params.bind(Datum::from(*id))
            ),
            Statement::SelectAll { table } => format!("SELECT * FROM {}", ident(table)),
            Statement::Update { table, id, assignments } => {
                let mut plain = Vec::new();
                let mut documents: Vec<(String, String)> = Vec::new();
                for (column, expr) in assignments {
                    let rhs = expr_sql(expr, &mut params);
                    match column {
                        Column::Plain(name) => plain.push(format!("{} = {rhs}", ident(name))),
                        Column::Doc { column, key } => {
                            let path = literal(&format!("{{{key}}}"));
                            match documents.iter_mut().find(|(c, _)| c == column) {
                                Some((_, acc)) => *acc = format!("jsonb_set({acc}, {path}, to_jsonb({rhs}))"),
                                None => documents.push((
                                    column.clone(),
                                    format!("jsonb_set({}, {path}, to_jsonb({rhs}))", ident(column)),
                                )),
                            }
                        }
                    }
                }
                plain.extend(documents.into_iter().map(|(c, acc)| format!("{} = {acc}", ident(&c))));
                format!(
                    "UPDATE {} SET {} WHERE {} = {}",
                    ident(table),
                    plain.join(", "),
                    ident(ID_COLUMN),
                    params.bind(Datum::from(*id))
                )
            }
            Statement::Delete { table, id } => format!(
                "DELETE FROM {} WHERE {} = {}",
                ident(table),
                ident(ID_COLUMN),
                params.bind(Datum::from(*id))
            ),
        };
        (sql, params.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BinaryOp;
    use serde_json::json;

    #[test]
    fn self_increment_renders_as_single_update() {
        let n = Column::slot_key("n_0");
        let statement = Statement::Update {
            table: "Counter".into(),
            id: 7,
            assignments: vec![(n.clone(), Expr::binary(BinaryOp::Add, Expr::Column(n), Expr::Param(json!(1))))],
        };
        let (sql, params) = statement.to_sql();
        assert_eq!(
            sql,
            "UPDATE \"Counter\" SET \"slots\" = jsonb_set(\"slots\", '{n_0}', to_jsonb((\"slots\"->'n_0' + $1))) WHERE \"id\" = $2"
        );
        assert_eq!(params, vec![json!(1), json!(7)]);
    }

    #[test]
    fn plain_columns_and_upserts() {
        let mut row = crate::storage::Row::new();
        row.insert("value".into(), json!(5));
        let (sql, params) = Statement::Upsert {
            table: "A".into(),
            id: 1,
            row,
        }
        .to_sql();
        assert_eq!(
            sql,
            "INSERT INTO \"A\" (\"id\", \"value\") VALUES ($1, $2) ON CONFLICT (\"id\") DO UPDATE SET \"value\" = EXCLUDED.\"value\""
        );
        assert_eq!(params.len(), 2);

        let (sql, _) = Statement::Select {
            table: "A".into(),
            id: 1,
            columns: vec![Column::plain("value"), Column::slot_key("x_1")],
        }
        .to_sql();
        assert_eq!(sql, "SELECT \"value\", \"slots\"->'x_1' FROM \"A\" WHERE \"id\" = $1");
    }
}

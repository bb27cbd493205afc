use crate::constant::ColumnType;
use crate::value::{DateTime, NullBitmap, Time, Value};

#[test]
fn natural_wire_types() {
    assert_eq!(Value::from(7i32).column_type(), ColumnType::MYSQL_TYPE_LONGLONG);
    assert!(Value::from(7u8).is_unsigned());
    assert_eq!(Value::from(1.5f32).column_type(), ColumnType::MYSQL_TYPE_FLOAT);
    assert_eq!(Value::from("x").column_type(), ColumnType::MYSQL_TYPE_VAR_STRING);
    assert_eq!(Value::from(vec![1u8]).column_type(), ColumnType::MYSQL_TYPE_BLOB);
    assert_eq!(
        Value::from(DateTime::date(2024, 2, 29)).column_type(),
        ColumnType::MYSQL_TYPE_DATETIME
    );
    assert_eq!(Value::from(Time::default()).column_type(), ColumnType::MYSQL_TYPE_TIME);
    assert_eq!(Value::from(None::<i32>), Value::Null);
}

#[test]
fn integer_accessors() {
    assert_eq!(Value::Int(-1).as_u64(), None);
    assert_eq!(Value::UInt(u64::MAX).as_i64(), None);
    assert_eq!(Value::UInt(42).as_i64(), Some(42));
    assert_eq!(Value::Decimal("1.50".to_string()).as_str(), Some("1.50"));
    assert_eq!(Value::Bytes(vec![0xFF]).as_str(), None);
}

#[test]
fn datetime_predicates() {
    assert!(DateTime::default().is_zero());
    assert!(!DateTime::date(2020, 1, 1).has_time());
    let dt = DateTime {
        microsecond: 5,
        ..DateTime::date(2020, 1, 1)
    };
    assert!(dt.has_time());
}

#[test]
fn null_bitmap_offsets() {
    // columns 0 and 3 null in a result row: bits 2 and 5
    let bitmap = [0b0010_0100];
    let nulls = NullBitmap::for_result_set(&bitmap);
    assert!(nulls.is_null(0));
    assert!(!nulls.is_null(1));
    assert!(nulls.is_null(3));
    assert!(!nulls.is_null(100));

    let params = NullBitmap::for_parameters(&bitmap);
    assert!(params.is_null(2));
    assert!(params.is_null(5));

    assert_eq!(NullBitmap::result_set_len(1), 1);
    assert_eq!(NullBitmap::result_set_len(6), 1);
    assert_eq!(NullBitmap::result_set_len(7), 2);
    assert_eq!(NullBitmap::parameters_len(0), 0);
    assert_eq!(NullBitmap::parameters_len(8), 1);
    assert_eq!(NullBitmap::parameters_len(9), 2);
}
